use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Link, LinkStatus, Rule, RuleStatus};
use crate::storage::{DocumentStore, Filter, Page, StoreError, StoreResult};

/// Collection holding rules
pub const RULES: &str = "Rules";

/// Collection holding links
pub const LINKS: &str = "Links";

/// Default number of active links sampled when picking a rule
pub const DEFAULT_SELECTION_SAMPLE: usize = 100;

/// Lease-based work distribution over the document store.
///
/// Every mutation of link state goes through `lock`, so allocation is atomic
/// with respect to other callers sharing this store. The conditional update
/// filters keep the transitions safe even against a second coordinator.
pub struct LeaseStore {
    /// Persistence collaborator
    store: Arc<dyn DocumentStore>,

    /// Serializes allocate, complete, reclaim and generation
    lock: Mutex<()>,

    /// Active links sampled for random rule selection
    selection_sample: usize,
}

fn millis(at: DateTime<Utc>) -> Value {
    json!(at.timestamp_millis())
}

fn decode<T: DeserializeOwned>(documents: Vec<Value>) -> StoreResult<Vec<T>> {
    documents
        .into_iter()
        .map(|document| serde_json::from_value(document).map_err(StoreError::from))
        .collect()
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

impl LeaseStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_selection_sample(store, DEFAULT_SELECTION_SAMPLE)
    }

    pub fn with_selection_sample(store: Arc<dyn DocumentStore>, selection_sample: usize) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            selection_sample: selection_sample.max(1),
        }
    }

    /// Insert or replace a rule, assigning an ID when missing
    pub async fn upsert_rule(&self, mut rule: Rule) -> StoreResult<Rule> {
        if rule.id.is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        rule.last_update = Utc::now();
        rule.validate()?;

        let document = serde_json::to_value(&rule)?;
        self.store
            .upsert_one(RULES, &Filter::new().eq("id", rule.id.as_str()), document)
            .await?;

        info!("Stored rule {} ({})", rule.id, rule.name);
        Ok(rule)
    }

    pub async fn get_rule(&self, id: &str) -> StoreResult<Rule> {
        let documents = self
            .store
            .find(RULES, &Filter::new().eq("id", id), Page::first(1))
            .await?;

        decode::<Rule>(documents)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("rule {}", id)))
    }

    pub async fn list_rules(&self, page: Page) -> StoreResult<Vec<Rule>> {
        decode(self.store.find(RULES, &Filter::new(), page).await?)
    }

    /// Active rules whose links should be (re)generated at `now`
    pub async fn due_rules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Rule>> {
        let filter = Filter::new().eq("status", RuleStatus::Active.as_str());
        let rules: Vec<Rule> = decode(self.store.find(RULES, &filter, Page::all()).await?)?;

        Ok(rules.into_iter().filter(|rule| rule.generation_due(now)).collect())
    }

    /// Cancel a rule together with its incomplete links
    pub async fn cancel_rule(&self, id: &str) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;
        self.get_rule(id).await?;

        self.store
            .update_many(
                RULES,
                &Filter::new().eq("id", id),
                fields(&[
                    ("status", json!(RuleStatus::Cancelled.as_str())),
                    ("lastUpdate", millis(Utc::now())),
                ]),
            )
            .await?;

        let cancelled = self.cancel_incomplete_links(id).await?;
        info!("Cancelled rule {} and {} of its links", id, cancelled);

        Ok(cancelled)
    }

    async fn cancel_incomplete_links(&self, rule_id: &str) -> StoreResult<u64> {
        let filter = Filter::new()
            .eq("ruleID", rule_id)
            .ne("status", LinkStatus::Completed.as_str());

        self.store
            .update_many(
                LINKS,
                &filter,
                fields(&[
                    ("status", json!(LinkStatus::Cancelled.as_str())),
                    ("worker", json!("")),
                    ("lastUpdate", millis(Utc::now())),
                ]),
            )
            .await
    }

    /// Replace the rule's incomplete links with a fresh set of pages.
    ///
    /// Returns the number of links inserted.
    pub async fn generate_links(&self, rule_id: &str) -> StoreResult<usize> {
        let _guard = self.lock.lock().await;

        let rule = self.get_rule(rule_id).await?;
        if rule.status == RuleStatus::Cancelled {
            return Err(StoreError::InvalidInput(format!("rule {} is cancelled", rule_id)));
        }
        let urls = rule.generate_links()?;

        let cancelled = self.cancel_incomplete_links(rule_id).await?;

        let links = urls
            .iter()
            .map(|url| serde_json::to_value(Link::new(url, rule_id)))
            .collect::<Result<Vec<_>, _>>()?;
        let count = links.len();
        self.store.insert_many(LINKS, links).await?;

        self.store
            .update_many(
                RULES,
                &Filter::new().eq("id", rule_id),
                fields(&[("lastGenerated", millis(Utc::now()))]),
            )
            .await?;

        info!(
            "Generated {} links for rule {} (cancelled {} incomplete)",
            count, rule_id, cancelled
        );
        Ok(count)
    }

    /// Lease up to `batch_size` active links of a rule to `worker`.
    ///
    /// Returns exactly the links now held by this worker, possibly none.
    pub async fn allocate(&self, rule_id: &str, worker: &str, batch_size: usize) -> StoreResult<Vec<Link>> {
        if worker.is_empty() {
            return Err(StoreError::InvalidInput("worker ID is empty".into()));
        }
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;

        let active = Filter::new()
            .eq("ruleID", rule_id)
            .eq("status", LinkStatus::Active.as_str());
        let candidates: Vec<Link> = decode(self.store.find(LINKS, &active, Page::first(batch_size)).await?)?;
        if candidates.is_empty() {
            debug!("No active links left for rule {}", rule_id);
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.into_iter().map(|link| link.id).collect();

        // The status condition keeps a concurrent coordinator from double leasing
        let claim = Filter::new()
            .within("id", ids.iter().cloned())
            .eq("status", LinkStatus::Active.as_str());
        self.store
            .update_many(
                LINKS,
                &claim,
                fields(&[
                    ("status", json!(LinkStatus::Running.as_str())),
                    ("worker", json!(worker)),
                    ("lastUpdate", millis(Utc::now())),
                ]),
            )
            .await?;

        let leased = Filter::new()
            .within("id", ids)
            .eq("worker", worker)
            .eq("status", LinkStatus::Running.as_str());
        let links: Vec<Link> = decode(self.store.find(LINKS, &leased, Page::all()).await?)?;

        debug!("Leased {} links of rule {} to {}", links.len(), rule_id, worker);
        Ok(links)
    }

    /// Mark links completed.
    ///
    /// Idempotent: completed, cancelled and unknown IDs are left untouched.
    pub async fn complete(&self, link_ids: &[String]) -> StoreResult<u64> {
        if link_ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;

        let filter = Filter::new().within("id", link_ids.iter().cloned()).within(
            "status",
            [LinkStatus::Running.as_str(), LinkStatus::Active.as_str()],
        );
        let updated = self
            .store
            .update_many(
                LINKS,
                &filter,
                fields(&[
                    ("status", json!(LinkStatus::Completed.as_str())),
                    ("worker", json!("")),
                    ("lastUpdate", millis(Utc::now())),
                ]),
            )
            .await?;

        debug!("Completed {} of {} reported links", updated, link_ids.len());
        Ok(updated)
    }

    /// Return running links whose lease is older than `stale_after` to the pool
    pub async fn reclaim(&self, stale_after: Duration) -> StoreResult<u64> {
        let _guard = self.lock.lock().await;

        let now = Utc::now();
        let filter = Filter::new()
            .eq("status", LinkStatus::Running.as_str())
            .lt("lastUpdate", millis(now - stale_after));

        let reclaimed = self
            .store
            .update_many(
                LINKS,
                &filter,
                fields(&[
                    ("status", json!(LinkStatus::Active.as_str())),
                    ("worker", json!("")),
                    ("lastUpdate", millis(now)),
                ]),
            )
            .await?;

        if reclaimed > 0 {
            warn!("Reclaimed {} stale running links", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Pick the rule a worker should run.
    ///
    /// An explicit ID must exist. Otherwise a random active rule with active
    /// links is chosen, weighted by how many of the sampled links it owns.
    pub async fn select_rule(&self, rule_id: Option<&str>) -> StoreResult<Option<Rule>> {
        if let Some(id) = rule_id.filter(|id| !id.is_empty()) {
            return self.get_rule(id).await.map(Some);
        }

        let active = Filter::new().eq("status", LinkStatus::Active.as_str());
        let sample: Vec<Link> = decode(
            self.store
                .find(LINKS, &active, Page::first(self.selection_sample))
                .await?,
        )?;

        let mut candidates: Vec<String> = sample.into_iter().map(|link| link.rule_id).collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut checked = Vec::new();
        for rule_id in candidates {
            if checked.contains(&rule_id) {
                continue;
            }
            match self.get_rule(&rule_id).await {
                Ok(rule) if rule.status == RuleStatus::Active => return Ok(Some(rule)),
                Ok(_) | Err(StoreError::NotFound(_)) => checked.push(rule_id),
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Links of a rule, for inspection
    pub async fn links_for_rule(&self, rule_id: &str, page: Page) -> StoreResult<Vec<Link>> {
        decode(
            self.store
                .find(LINKS, &Filter::new().eq("ruleID", rule_id), page)
                .await?,
        )
    }
}
