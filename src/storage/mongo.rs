use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, UpdateOptions};
use mongodb::{Client, Collection, Database};
use serde_json::{Map, Value};
use tracing::debug;

use super::document::{Condition, DocumentStore, Filter, Page, StoreError, StoreResult};
use crate::cli::config::StorageSettings;

/// MongoDB implementation of the document store
pub struct MongoStore {
    /// MongoDB database
    database: Database,
}

impl MongoStore {
    /// Connect and verify the database is reachable
    pub async fn new(settings: &StorageSettings) -> StoreResult<Self> {
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .map_err(backend)?;

        let client = Client::with_options(client_options).map_err(backend)?;
        let database = client.database(&settings.database_name);

        // Test connection
        database.list_collection_names(None).await.map_err(backend)?;

        debug!("Connected to MongoDB database: {}", settings.database_name);

        Ok(Self { database })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Documents use `id`; MongoDB wants `_id`
fn field_name(field: &str) -> &str {
    if field == "id" {
        "_id"
    } else {
        field
    }
}

fn to_bson(value: &Value) -> StoreResult<Bson> {
    bson::to_bson(value).map_err(backend)
}

fn filter_document(filter: &Filter) -> StoreResult<Document> {
    let mut document = Document::new();

    for (field, condition) in filter.conditions() {
        let predicate = match condition {
            Condition::Eq(value) => to_bson(value)?,
            Condition::Ne(value) => Bson::Document(doc! { "$ne": to_bson(value)? }),
            Condition::Lt(value) => Bson::Document(doc! { "$lt": to_bson(value)? }),
            Condition::In(values) => {
                let values = values.iter().map(to_bson).collect::<StoreResult<Vec<_>>>()?;
                Bson::Document(doc! { "$in": values })
            }
        };
        document.insert(field_name(field), predicate);
    }

    Ok(document)
}

fn to_document(value: &Value) -> StoreResult<Document> {
    let mut document = bson::to_document(value).map_err(backend)?;
    if let Some(id) = document.remove("id") {
        document.insert("_id", id);
    }
    Ok(document)
}

fn from_document(mut document: Document) -> Value {
    if let Some(id) = document.remove("_id") {
        document.insert("id", id);
    }
    Bson::Document(document).into_relaxed_extjson()
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn find(&self, collection: &str, filter: &Filter, page: Page) -> StoreResult<Vec<Value>> {
        let mut options = FindOptions::default();
        options.skip = Some(page.skip as u64);
        options.limit = page.limit.map(|limit| limit as i64);

        let mut cursor = self
            .collection(collection)
            .find(filter_document(filter)?, options)
            .await
            .map_err(backend)?;

        let mut results = Vec::new();
        while let Some(document) = cursor.next().await {
            results.push(from_document(document.map_err(backend)?));
        }

        Ok(results)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> StoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let documents = documents.iter().map(to_document).collect::<StoreResult<Vec<_>>>()?;
        let count = documents.len();

        self.collection(collection)
            .insert_many(documents, None)
            .await
            .map_err(backend)?;

        debug!("Inserted {} documents into {}", count, collection);

        Ok(())
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> StoreResult<u64> {
        let set = to_document(&Value::Object(set))?;

        let result = self
            .collection(collection)
            .update_many(filter_document(filter)?, doc! { "$set": set }, None)
            .await
            .map_err(backend)?;

        Ok(result.matched_count)
    }

    async fn upsert_one(&self, collection: &str, filter: &Filter, document: Value) -> StoreResult<()> {
        let mut set = to_document(&document)?;
        // The primary key comes from the filter and is immutable once stored
        set.remove("_id");

        let mut options = UpdateOptions::default();
        options.upsert = Some(true);

        self.collection(collection)
            .update_one(filter_document(filter)?, doc! { "$set": set }, options)
            .await
            .map_err(backend)?;

        Ok(())
    }
}
