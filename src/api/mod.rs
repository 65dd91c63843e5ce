pub mod client;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;

use crate::lease::{Link, Rule};
use crate::storage::StoreError;

// Re-export common types
pub use client::HttpJobApi;
pub use local::LocalJobApi;

/// Errors raised by a job API call
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Job API answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The worker's view of the coordinator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    /// The pinned rule when an ID is given, otherwise any rule with active links
    async fn fetch_rule(&self, rule_id: Option<String>) -> Result<Option<Rule>, ApiError>;

    /// Lease a batch of links of the rule to `worker`
    async fn allocate(&self, rule_id: &str, worker: &str, size: usize) -> Result<Vec<Link>, ApiError>;

    /// Report links as completed
    async fn complete(&self, link_ids: &[String]) -> Result<(), ApiError>;
}
