use async_trait::async_trait;
use std::sync::Arc;

use super::{ApiError, JobApi};
use crate::lease::{LeaseStore, Link, Rule};

/// Job API served straight from an in-process lease store
pub struct LocalJobApi {
    store: Arc<LeaseStore>,
}

impl LocalJobApi {
    pub fn new(store: Arc<LeaseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobApi for LocalJobApi {
    async fn fetch_rule(&self, rule_id: Option<String>) -> Result<Option<Rule>, ApiError> {
        Ok(self.store.select_rule(rule_id.as_deref()).await?)
    }

    async fn allocate(&self, rule_id: &str, worker: &str, size: usize) -> Result<Vec<Link>, ApiError> {
        Ok(self.store.allocate(rule_id, worker, size).await?)
    }

    async fn complete(&self, link_ids: &[String]) -> Result<(), ApiError> {
        self.store.complete(link_ids).await?;
        Ok(())
    }
}
