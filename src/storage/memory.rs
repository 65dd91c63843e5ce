use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::document::{Condition, DocumentStore, Filter, Page, StoreError, StoreResult};

/// In-process document store.
///
/// Used for tests and for single-process deployments where the lease state
/// does not need to survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

fn as_object(document: Value) -> StoreResult<Map<String, Value>> {
    match document {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidInput(format!(
            "documents must be JSON objects, got {}",
            other
        ))),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: &Filter, page: Page) -> StoreResult<Vec<Value>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let matching = documents
            .iter()
            .filter(|doc| filter.matches(doc))
            .skip(page.skip)
            .take(page.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(matching)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> StoreResult<()> {
        if documents.is_empty() {
            return Ok(());
        }

        // Validate the whole batch before touching the collection
        let objects = documents
            .into_iter()
            .map(|doc| as_object(doc).map(Value::Object))
            .collect::<StoreResult<Vec<_>>>()?;

        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        debug!("Inserting {} documents into {}", objects.len(), collection);
        target.extend(objects);

        Ok(())
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> StoreResult<u64> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut updated = 0;
        for doc in documents.iter_mut().filter(|doc| filter.matches(doc)) {
            if let Value::Object(fields) = doc {
                for (key, value) in &set {
                    fields.insert(key.clone(), value.clone());
                }
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn upsert_one(&self, collection: &str, filter: &Filter, document: Value) -> StoreResult<()> {
        let fields = as_object(document)?;

        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();

        if let Some(Value::Object(existing)) = documents.iter_mut().find(|doc| filter.matches(doc)) {
            existing.extend(fields);
            return Ok(());
        }

        // Mirror upsert semantics: equality predicates become part of the new document
        let mut inserted = fields;
        for (field, condition) in filter.conditions() {
            if let Condition::Eq(value) = condition {
                inserted.entry(field.clone()).or_insert_with(|| value.clone());
            }
        }
        documents.push(Value::Object(inserted));

        Ok(())
    }
}
