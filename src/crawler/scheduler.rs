use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::task::{FetchTarget, MAX_DEPTH};
use crate::extract::DeepLink;
use crate::lease::Link;

/// Local work queue of one crawl loop.
///
/// Tracks which allocated link each seed URL belongs to, the parent values of
/// discovered detail pages, and how often every URL has been requeued.
pub struct FetchQueue {
    /// URLs waiting for the next fetch cycle
    pending: Vec<FetchTarget>,

    /// Seed URL -> link ID
    link_ids: HashMap<String, String>,

    /// Detail URL -> value taken from its listing page
    parent_values: HashMap<String, String>,

    /// URL -> requeue count
    attempts: HashMap<String, u32>,

    /// Link IDs whose seed page reached a terminal outcome
    processed: Vec<String>,

    /// Link IDs whose seed page was given up on
    given_up: HashSet<String>,

    /// Requeues allowed before a URL is dropped
    give_up_after: u32,
}

impl FetchQueue {
    pub fn new(give_up_after: u32) -> Self {
        Self {
            pending: Vec::new(),
            link_ids: HashMap::new(),
            parent_values: HashMap::new(),
            attempts: HashMap::new(),
            processed: Vec::new(),
            given_up: HashSet::new(),
            give_up_after,
        }
    }

    /// Queue freshly allocated links
    pub fn seed(&mut self, links: &[Link]) {
        for link in links {
            self.link_ids.insert(link.link.clone(), link.id.clone());
            self.pending.push(FetchTarget::seed(&link.link));
        }
    }

    /// Queue a detail page found on a listing page, returning whether it was queued
    pub fn discover(&mut self, link: DeepLink, from: &FetchTarget) -> bool {
        let depth = from.depth + 1;
        if depth > MAX_DEPTH {
            debug!("Not following {} beyond depth {}", link.url, MAX_DEPTH);
            return false;
        }

        self.parent_values.insert(link.url.clone(), link.parent_value);
        self.pending.push(FetchTarget { url: link.url, depth });
        true
    }

    /// Put a failed target back for the next cycle.
    ///
    /// Returns false when the URL used up its attempts and was dropped.
    pub fn requeue(&mut self, target: FetchTarget) -> bool {
        let attempts = self.attempts.entry(target.url.clone()).or_insert(0);
        *attempts += 1;

        if *attempts > self.give_up_after {
            warn!("Giving up on {} after {} attempts", target.url, attempts);
            self.parent_values.remove(&target.url);
            if let Some(id) = self.link_ids.get(&target.url) {
                self.given_up.insert(id.clone());
            }
            return false;
        }

        self.pending.push(target);
        true
    }

    /// Record a terminal outcome for a URL
    pub fn mark_processed(&mut self, url: &str) {
        if let Some(id) = self.link_ids.get(url) {
            if !self.processed.contains(id) {
                self.processed.push(id.clone());
            }
        }
    }

    pub fn parent_value(&self, url: &str) -> String {
        self.parent_values.get(url).cloned().unwrap_or_default()
    }

    pub fn drop_parent_value(&mut self, url: &str) {
        self.parent_values.remove(url);
    }

    /// Take every pending target for a fetch cycle
    pub fn drain(&mut self) -> Vec<FetchTarget> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Link IDs safe to report complete
    pub fn processed_ids(&self) -> Vec<String> {
        self.processed
            .iter()
            .filter(|id| !self.given_up.contains(*id))
            .cloned()
            .collect()
    }

    pub fn given_up_count(&self) -> usize {
        self.given_up.len()
    }

    /// Pause before a fetch cycle, scaled to the queue size and clamped to `[min, max]`
    pub fn cooldown(&self, min: Duration, max: Duration) -> Duration {
        let seconds = rand::thread_rng().gen_range(0..=self.pending.len() as u64);
        Duration::from_secs(seconds).clamp(min, max.max(min))
    }
}
