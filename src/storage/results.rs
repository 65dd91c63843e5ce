use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::document::{DocumentStore, StoreError, StoreResult};

/// Append-only sink for extraction records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert the whole batch into the named collection
    async fn insert_many(&self, collection: &str, records: Vec<serde_json::Value>) -> StoreResult<()>;
}

/// Result sink writing into the shared document store
pub struct StoreResultSink {
    store: Arc<dyn DocumentStore>,
}

impl StoreResultSink {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResultSink for StoreResultSink {
    async fn insert_many(&self, collection: &str, records: Vec<serde_json::Value>) -> StoreResult<()> {
        if collection.is_empty() {
            return Err(StoreError::InvalidInput("result collection name is empty".into()));
        }

        let count = records.len();
        self.store.insert_many(collection, records).await?;
        debug!("Stored {} records in {}", count, collection);

        Ok(())
    }
}
