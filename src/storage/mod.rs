pub mod document;
pub mod memory;
pub mod mongo;
pub mod results;

use anyhow::Result;
use std::sync::Arc;

use crate::cli::config::StorageSettings;

// Re-export common types
pub use document::{DocumentStore, Filter, Page, StoreError, StoreResult};
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use results::{ResultSink, StoreResultSink};

/// Factory for the configured document store backend
pub struct DocumentStoreFactory;

impl DocumentStoreFactory {
    /// Create a document store based on the settings
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn DocumentStore>> {
        match settings.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryStore::new())),
            "mongodb" => {
                let store = MongoStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            other => anyhow::bail!("Unsupported storage backend: {}", other),
        }
    }
}
