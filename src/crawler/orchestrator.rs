use anyhow::{Result, bail};
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::controller::{CrawlLoop, LoopReport};
use crate::api::JobApi;
use crate::cli::config::{ProxySettings, WorkerSettings};
use crate::storage::ResultSink;

/// How one worker instance of a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Completed(LoopReport),

    /// No rule had work to hand out
    Idle,

    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub outcomes: Vec<InstanceOutcome>,
}

impl RoundReport {
    /// A round succeeds when at least one instance finished its crawl
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| matches!(outcome, InstanceOutcome::Completed(_)))
    }
}

/// Runs rounds of concurrent crawl loops against the job API
pub struct Orchestrator {
    api: Arc<dyn JobApi>,
    sink: Arc<dyn ResultSink>,
    settings: WorkerSettings,
    proxy: ProxySettings,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn JobApi>, sink: Arc<dyn ResultSink>, settings: WorkerSettings, proxy: ProxySettings) -> Self {
        Self {
            api,
            sink,
            settings,
            proxy,
        }
    }

    /// Repeat rounds, pausing after every failed one. With `once` a single
    /// round runs and its failure is returned.
    pub async fn run(&self, once: bool) -> Result<()> {
        loop {
            info!("Starting a new crawl round with {} instances", self.settings.instances);
            let report = self.run_round().await;

            if report.succeeded() {
                info!("Crawl round completed");
                if once {
                    return Ok(());
                }
                continue;
            }

            if once {
                bail!("No worker instance completed a crawl: {:?}", report.outcomes);
            }
            warn!(
                "Crawl round did not complete, waiting {}s before the next one",
                self.settings.round_backoff
            );
            sleep(Duration::from_secs(self.settings.round_backoff)).await;
        }
    }

    /// Spawn every instance with a random start delay and wait for all of them
    pub async fn run_round(&self) -> RoundReport {
        let handles: Vec<_> = (0..self.settings.instances.max(1))
            .map(|index| {
                let api = Arc::clone(&self.api);
                let sink = Arc::clone(&self.sink);
                let settings = self.settings.clone();
                let proxy = self.proxy.clone();
                tokio::spawn(run_instance(index, api, sink, settings, proxy))
            })
            .collect();

        let outcomes = join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => InstanceOutcome::Failed(format!("worker task panicked: {}", e)),
            })
            .collect();

        RoundReport { outcomes }
    }
}

async fn run_instance(
    index: usize,
    api: Arc<dyn JobApi>,
    sink: Arc<dyn ResultSink>,
    settings: WorkerSettings,
    proxy: ProxySettings,
) -> InstanceOutcome {
    let stagger = rand::thread_rng().gen_range(0..=settings.start_stagger);
    sleep(Duration::from_secs(stagger)).await;

    let rule = match api.fetch_rule(settings.rule_id.clone()).await {
        Ok(Some(rule)) => rule,
        Ok(None) => {
            info!("Instance {} found no rule with pending links", index);
            return InstanceOutcome::Idle;
        }
        Err(e) => {
            error!("Instance {} could not fetch a rule: {}", index, e);
            return InstanceOutcome::Failed(e.to_string());
        }
    };

    let worker_id = format!("worker-{}", Uuid::new_v4().simple());
    info!("Instance {} ({}) crawling rule {} ({})", index, worker_id, rule.id, rule.name);

    let max_runtime = settings.max_runtime();
    let hard_limit = max_runtime + settings.shutdown_grace();
    let crawl = CrawlLoop::new(api, sink, settings, proxy, &worker_id);

    match timeout(hard_limit, crawl.run(&rule, Instant::now() + max_runtime)).await {
        Ok(Ok(report)) => {
            info!(
                "Instance {} finished rule {}: {} leased, {} completed, {} records",
                index, report.rule_id, report.allocated, report.completed, report.records
            );
            InstanceOutcome::Completed(report)
        }
        Ok(Err(e)) => {
            error!("Instance {} failed: {:#}", index, e);
            InstanceOutcome::Failed(format!("{:#}", e))
        }
        Err(_) => {
            error!("Instance {} exceeded {:?} and was stopped", index, hard_limit);
            InstanceOutcome::Failed(format!("stopped after {:?}", hard_limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockJobApi};
    use crate::lease::Rule;
    use crate::storage::{MemoryStore, StoreResultSink};

    fn settings(instances: usize) -> WorkerSettings {
        WorkerSettings {
            instances,
            start_stagger: 0,
            cooldown_min: 0,
            cooldown_max: 0,
            request_delay_max: 0,
            ..WorkerSettings::default()
        }
    }

    fn orchestrator(api: MockJobApi, instances: usize) -> Orchestrator {
        Orchestrator::new(
            Arc::new(api),
            Arc::new(StoreResultSink::new(Arc::new(MemoryStore::new()))),
            settings(instances),
            ProxySettings::default(),
        )
    }

    #[tokio::test]
    async fn test_round_without_rules_is_idle() {
        let mut api = MockJobApi::new();
        api.expect_fetch_rule().times(2).returning(|_| Ok(None));

        let report = orchestrator(api, 2).run_round().await;

        assert_eq!(report.outcomes, vec![InstanceOutcome::Idle, InstanceOutcome::Idle]);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_round_succeeds_when_one_instance_completes() {
        let mut api = MockJobApi::new();
        let mut calls = 0;
        api.expect_fetch_rule().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(Some(Rule::new("shop", "products", r#"{"t": {"pattern": "h1", "value": "text"}}"#, "http://x/{page}", 1)))
            } else {
                Err(ApiError::Status { status: 500, body: "down".into() })
            }
        });
        api.expect_allocate().returning(|_, _, _| Ok(Vec::new()));

        let report = orchestrator(api, 2).run_round().await;

        assert!(report.succeeded());
        assert_eq!(
            report
                .outcomes
                .iter()
                .filter(|outcome| matches!(outcome, InstanceOutcome::Failed(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_pinned_rule_is_requested() {
        let mut api = MockJobApi::new();
        api.expect_fetch_rule()
            .withf(|rule_id: &Option<String>| rule_id.as_deref() == Some("r42"))
            .times(1)
            .returning(|_| Ok(None));

        let mut orchestrator = orchestrator(api, 1);
        orchestrator.settings.rule_id = Some("r42".to_string());

        tokio_test::assert_err!(orchestrator.run(true).await);
    }
}
