use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::store::LeaseStore;
use crate::cli::config::LeaseSettings;

/// Handles of the coordinator's periodic tasks, aborted on drop
pub struct MaintenanceJobs {
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceJobs {
    /// Start the reclaim sweep and the link regeneration timer
    pub fn start(store: Arc<LeaseStore>, settings: &LeaseSettings) -> Self {
        let sweep = tokio::spawn(reclaim_loop(store.clone(), settings.clone()));
        let generation = tokio::spawn(generation_loop(store, settings.clone()));

        Self {
            handles: vec![sweep, generation],
        }
    }
}

impl Drop for MaintenanceJobs {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn reclaim_loop(store: Arc<LeaseStore>, settings: LeaseSettings) {
    let mut ticker = interval(settings.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match store.reclaim(settings.reclaim_after()).await {
            Ok(count) => debug!("Reclaim sweep returned {} links to the pool", count),
            Err(e) => error!("Reclaim sweep failed: {}", e),
        }
    }
}

async fn generation_loop(store: Arc<LeaseStore>, settings: LeaseSettings) {
    let mut ticker = interval(settings.generation_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = generate_due_rules(&store).await {
            error!("Link regeneration failed: {}", e);
        }
    }
}

/// Generate links for every rule that is due, returning how many were regenerated
pub async fn generate_due_rules(store: &LeaseStore) -> crate::storage::StoreResult<usize> {
    let due = store.due_rules(Utc::now()).await?;
    let mut generated = 0;

    for rule in due {
        match store.generate_links(&rule.id).await {
            Ok(count) => {
                info!("Regenerated {} links for rule {} ({})", count, rule.id, rule.name);
                generated += 1;
            }
            Err(e) => error!("Failed to generate links for rule {}: {}", rule.id, e),
        }
    }

    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::model::{LinkStatus, Rule};
    use crate::storage::{MemoryStore, Page};
    use std::time::Duration;

    #[tokio::test]
    async fn test_generate_due_rules_runs_once_for_one_shot_rules() {
        let store = LeaseStore::new(Arc::new(MemoryStore::new()));
        let rule = store
            .upsert_rule(Rule::new("once", "results", "{}", "http://x/{page}", 2))
            .await
            .unwrap();

        assert_eq!(generate_due_rules(&store).await.unwrap(), 1);
        assert_eq!(generate_due_rules(&store).await.unwrap(), 0);

        let links = store.links_for_rule(&rule.id, Page::all()).await.unwrap();
        assert_eq!(links.len(), 2);
    }

    #[tokio::test]
    async fn test_jobs_sweep_stale_leases() {
        let store = Arc::new(LeaseStore::new(Arc::new(MemoryStore::new())));
        let rule = store
            .upsert_rule(Rule::new("sweep", "results", "{}", "http://x/{page}", 1))
            .await
            .unwrap();
        store.generate_links(&rule.id).await.unwrap();
        store.allocate(&rule.id, "w1", 1).await.unwrap();

        let settings = LeaseSettings {
            reclaim_after: 0,
            sweep_interval: 1,
            generation_interval: 3600,
            selection_sample: 10,
        };
        // The first tick fires immediately; give the lease a moment to age
        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = MaintenanceJobs::start(store.clone(), &settings);
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(jobs);

        let links = store.links_for_rule(&rule.id, Page::all()).await.unwrap();
        assert_eq!(links[0].status, LinkStatus::Active);
        assert!(links[0].worker.is_empty());
    }
}
