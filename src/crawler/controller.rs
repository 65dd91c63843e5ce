use anyhow::{Result, Context};
use chrono::{Timelike, Utc};
use futures::stream::{self, StreamExt};
use scraper::Html;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use super::buffer::ResultBuffer;
use super::fetcher::{FetchError, FetchedPage, Fetcher};
use super::scheduler::FetchQueue;
use super::task::{ExtractionRecord, FetchTarget, LayoutDiagnostic};
use crate::api::JobApi;
use crate::cli::config::{ProxySettings, WorkerSettings};
use crate::extract::{evaluate, DeepLink, DeepLinkPattern, PatternNode, Record};
use crate::lease::Rule;
use crate::proxy::IdentityManager;
use crate::storage::ResultSink;
use crate::utils::{MetricsCollector, PageEvent};

/// Summary of one finished crawl loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub rule_id: String,

    /// Links leased over the loop's lifetime
    pub allocated: usize,

    /// Links reported complete
    pub completed: usize,

    /// Links dropped after too many attempts
    pub given_up: usize,

    /// Records buffered for the result sink
    pub records: usize,
}

/// What a fetched page turned out to be
#[derive(Debug)]
enum PageOutcome {
    /// Listing page; the detail pages go back into the queue
    DeepLinks(Vec<DeepLink>),
    Record(Record),
    WrongPage,
    Invalid,
}

/// Decide what a page is. Kept synchronous so the parsed DOM never lives
/// across an await point.
fn process_page(
    page: &FetchedPage,
    pattern: &PatternNode,
    deep_links: Option<&DeepLinkPattern>,
    parent_value: &str,
) -> PageOutcome {
    let document = Html::parse_document(&page.body);

    if let (Some(deep), Ok(page_url)) = (deep_links, Url::parse(&page.url)) {
        if let Some(links) = deep.discover(&document, &page_url) {
            return PageOutcome::DeepLinks(links);
        }
    }

    let evaluation = evaluate(document.root_element(), pattern, parent_value);
    if evaluation.wrong_page {
        PageOutcome::WrongPage
    } else if evaluation.is_valid() {
        PageOutcome::Record(evaluation.record)
    } else {
        PageOutcome::Invalid
    }
}

/// Identity refresh and periodic result flush.
///
/// `shutdown` lets an in-flight flush finish; dropping aborts both tasks.
struct BackgroundTasks {
    refresher: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl BackgroundTasks {
    fn start(
        identity: Arc<IdentityManager>,
        buffer: Arc<ResultBuffer>,
        test_url: Option<String>,
        proxy: &ProxySettings,
        flush_every: Duration,
    ) -> Self {
        let refresher = test_url.map(|test_url| {
            let refresh_every = proxy.refresh_interval();
            tokio::spawn(async move {
                let mut ticker = interval(refresh_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = identity.refresh(&test_url).await {
                        warn!("Proxy refresh failed: {:#}", e);
                    }
                }
            })
        });

        let (stop, mut stopped) = watch::channel(false);
        let flush_every = flush_every.max(Duration::from_millis(100));
        let flusher = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + flush_every, flush_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush().await {
                            error!("Periodic result flush failed: {}", e);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        Self {
            refresher,
            flusher: Some(flusher),
            stop,
        }
    }

    /// Stop both tasks, waiting for a flush that is already writing
    async fn shutdown(mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }

        let _ = self.stop.send(true);
        if let Some(flusher) = self.flusher.take() {
            if let Err(e) = flusher.await {
                error!("Result flusher stopped abnormally: {}", e);
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in self.refresher.iter().chain(self.flusher.iter()) {
            handle.abort();
        }
    }
}

/// One worker's crawl of a single rule.
///
/// Leases batches of links, fetches them through a rotating identity,
/// extracts records and keeps going until the rule has no Active links left
/// or the graceful deadline passes.
pub struct CrawlLoop {
    api: Arc<dyn JobApi>,
    sink: Arc<dyn ResultSink>,
    settings: WorkerSettings,
    proxy: ProxySettings,
    worker_id: String,
}

impl CrawlLoop {
    pub fn new(
        api: Arc<dyn JobApi>,
        sink: Arc<dyn ResultSink>,
        settings: WorkerSettings,
        proxy: ProxySettings,
        worker_id: &str,
    ) -> Self {
        Self {
            api,
            sink,
            settings,
            proxy,
            worker_id: worker_id.to_string(),
        }
    }

    /// Crawl the rule until its links run out or `deadline` passes
    pub async fn run(&self, rule: &Rule, deadline: Instant) -> Result<LoopReport> {
        let pattern = rule
            .parsed_pattern()
            .context(format!("Invalid extraction pattern on rule {}", rule.id))?;
        let deep_links = rule
            .parsed_deep_links()
            .context(format!("Invalid deep link pattern on rule {}", rule.id))?;

        let identity = Arc::new(IdentityManager::new(self.proxy.clone())?);
        let test_url = if identity.proxies_enabled() {
            let origin = rule
                .origin()
                .context(format!("Rule {} has no usable origin to validate proxies against", rule.id))?;
            Some(origin)
        } else {
            None
        };

        let buffer = Arc::new(ResultBuffer::new(
            Arc::clone(&self.sink),
            &rule.target_location,
            self.settings.write_layout_errors,
        ));
        let background = BackgroundTasks::start(
            Arc::clone(&identity),
            Arc::clone(&buffer),
            test_url,
            &self.proxy,
            self.settings.flush_interval(),
        );

        let metrics = MetricsCollector::new();
        let mut queue = FetchQueue::new(self.settings.give_up_after);
        let mut report = LoopReport {
            rule_id: rule.id.clone(),
            ..LoopReport::default()
        };

        let links = self
            .api
            .allocate(&rule.id, &self.worker_id, self.settings.batch_size)
            .await
            .context(format!("Failed to allocate links for rule {}", rule.id))?;
        info!("Worker {} leased {} links of rule {}", self.worker_id, links.len(), rule.id);
        report.allocated += links.len();
        queue.seed(&links);

        let mut failure = None;
        while !queue.is_empty() {
            if Instant::now() >= deadline {
                warn!("Worker {} reached its runtime limit with {} URLs queued", self.worker_id, queue.len());
                break;
            }

            let pause = queue.cooldown(
                Duration::from_secs(self.settings.cooldown_min),
                Duration::from_secs(self.settings.cooldown_max),
            );
            debug!("Cooling down for {:?} before fetching {} URLs", pause, queue.len());
            sleep(pause).await;

            let fetcher = match Fetcher::build(rule, Arc::clone(&identity), &self.settings) {
                Ok(fetcher) => fetcher,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            self.fetch_cycle(
                &fetcher,
                &mut queue,
                &identity,
                &buffer,
                &metrics,
                &pattern,
                deep_links.as_ref(),
                &mut report,
            )
            .await;

            if queue.is_empty() && Instant::now() < deadline {
                match self.api.allocate(&rule.id, &self.worker_id, self.settings.batch_size).await {
                    Ok(links) => {
                        debug!("Worker {} leased {} more links", self.worker_id, links.len());
                        report.allocated += links.len();
                        queue.seed(&links);
                    }
                    Err(e) => error!("Failed to allocate more links for rule {}: {}", rule.id, e),
                }
            }
        }

        background.shutdown().await;
        buffer
            .flush()
            .await
            .context(format!("Failed to store results of rule {}", rule.id))?;
        if buffer.pending_diagnostics() > 0 {
            warn!(
                "Dropping {} layout diagnostics of rule {} that could not be stored",
                buffer.pending_diagnostics(),
                rule.id
            );
        }

        let processed = queue.processed_ids();
        if !processed.is_empty() {
            match self.api.complete(&processed).await {
                Ok(()) => report.completed = processed.len(),
                Err(e) => error!("Failed to report {} completed links: {}", processed.len(), e),
            }
        }
        report.given_up = queue.given_up_count();

        metrics.log_summary(&format!("Worker {} rule {}", self.worker_id, rule.id)).await;
        match failure {
            Some(e) => Err(e.context(format!("Crawl of rule {} stopped early", rule.id))),
            None => Ok(report),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_cycle(
        &self,
        fetcher: &Fetcher,
        queue: &mut FetchQueue,
        identity: &IdentityManager,
        buffer: &ResultBuffer,
        metrics: &MetricsCollector,
        pattern: &PatternNode,
        deep_links: Option<&DeepLinkPattern>,
        report: &mut LoopReport,
    ) {
        let targets = queue.drain();
        let mut fetches = stream::iter(targets)
            .map(|target| async move {
                let timer = metrics.start_timer();
                let result = fetcher.fetch(&target.url).await;
                (target, result, timer.end())
            })
            .buffer_unordered(self.settings.threads.max(1));

        while let Some((target, result, elapsed)) = fetches.next().await {
            match result {
                Ok(page) => {
                    metrics
                        .record_request(true, elapsed, Some(page.status), page.body.len())
                        .await;

                    let parent_value = queue.parent_value(&target.url);
                    match process_page(&page, pattern, deep_links, &parent_value) {
                        PageOutcome::DeepLinks(links) => {
                            let queued = links
                                .into_iter()
                                .filter(|link| queue.discover(link.clone(), &target))
                                .count();
                            debug!("{} deep links queued from {}", queued, target.url);
                            queue.mark_processed(&target.url);
                            metrics.record_page(PageEvent::DeepLinks(queued)).await;
                        }
                        PageOutcome::Record(fields) => {
                            buffer.push_record(ExtractionRecord::new(&target.url, fields));
                            queue.drop_parent_value(&target.url);
                            queue.mark_processed(&target.url);
                            report.records += 1;
                            metrics.record_page(PageEvent::Record).await;
                        }
                        PageOutcome::WrongPage => {
                            warn!("Page layout mismatch on {}", target.url);
                            buffer.push_diagnostic(LayoutDiagnostic::new(&target.url, &identity.cookie(), page.body));
                            if Utc::now().second() % 5 == 0 {
                                identity.rotate_on_failure(false, true);
                            } else {
                                identity.rotate_on_failure(true, true);
                            }
                            metrics.record_page(PageEvent::WrongPage).await;
                            Self::retry(queue, metrics, target).await;
                        }
                        PageOutcome::Invalid => {
                            info!("No valid content on {}, dropping it", target.url);
                            queue.drop_parent_value(&target.url);
                            queue.mark_processed(&target.url);
                            metrics.record_page(PageEvent::Invalid).await;
                        }
                    }
                }
                Err(e) => {
                    let status = match e {
                        FetchError::Connection(ref reason) => {
                            debug!("Connection error on {}: {}", target.url, reason);
                            identity.rotate_on_failure(true, false);
                            None
                        }
                        FetchError::Http(status) => {
                            identity.rotate_on_failure(true, true);
                            Some(status)
                        }
                    };
                    metrics.record_request(false, elapsed, status, 0).await;
                    Self::retry(queue, metrics, target).await;
                }
            }
        }
    }

    async fn retry(queue: &mut FetchQueue, metrics: &MetricsCollector, target: FetchTarget) {
        let event = if queue.requeue(target) {
            PageEvent::Requeued
        } else {
            PageEvent::GaveUp
        };
        metrics.record_page(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockJobApi;
    use crate::crawler::task::LAYOUT_ERRORS;
    use crate::lease::{Link, LinkStatus};
    use crate::storage::{MemoryStore, StoreResult, StoreResultSink};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRODUCT_PATTERN: &str = r#"{"title": {"pattern": "h1.title", "value": "text"}}"#;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            threads: 4,
            batch_size: 10,
            give_up_after: 2,
            cooldown_min: 0,
            cooldown_max: 0,
            request_delay_max: 0,
            ..WorkerSettings::default()
        }
    }

    /// Sink whose writes take a while to land
    #[derive(Default)]
    struct SlowSink {
        stored: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ResultSink for SlowSink {
        async fn insert_many(&self, _collection: &str, records: Vec<Value>) -> StoreResult<()> {
            sleep(Duration::from_millis(500)).await;
            self.stored.lock().unwrap().extend(records);
            Ok(())
        }
    }

    fn leased(url: &str) -> Link {
        let mut link = Link::new(url, "r1");
        link.status = LinkStatus::Running;
        link.worker = "w1".to_string();
        link
    }

    fn page(url: &str, body: &str) -> FetchedPage {
        FetchedPage {
            url: url.to_string(),
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_process_page_outcomes() {
        let pattern = PatternNode::parse(PRODUCT_PATTERN).unwrap();

        let found = process_page(
            &page("http://x/1", "<html><body><h1 class='title'> Lamp </h1></body></html>"),
            &pattern,
            None,
            "",
        );
        match found {
            PageOutcome::Record(record) => assert_eq!(record["title"]["value"], "Lamp"),
            other => panic!("expected a record, got {:?}", other),
        }

        let wrong = process_page(&page("http://x/1", "<html><body>captcha</body></html>"), &pattern, None, "");
        assert!(matches!(wrong, PageOutcome::WrongPage));

        let empty = process_page(
            &page("http://x/1", "<html><body><h1 class='title'>  </h1></body></html>"),
            &pattern,
            None,
            "",
        );
        assert!(matches!(empty, PageOutcome::Invalid));
    }

    #[test]
    fn test_listing_page_yields_deep_links() {
        let pattern = PatternNode::parse(PRODUCT_PATTERN).unwrap();
        let fragments: Vec<String> = vec!["li.item".into(), "span".into(), "a".into()];
        let deep = DeepLinkPattern::parse(&fragments).unwrap().unwrap();
        let body = "<html><body><ul>\
            <li class='item'><span>Red</span><a href='/p/1'>1</a></li>\
            <li class='item'><span>Blue</span><a href='/p/2'>2</a></li>\
            </ul></body></html>";

        match process_page(&page("http://shop.test/list", body), &pattern, Some(&deep), "") {
            PageOutcome::DeepLinks(links) => {
                assert_eq!(links.len(), 2);
                assert_eq!(links[1].url, "http://shop.test/p/2");
                assert_eq!(links[1].parent_value, "Blue");
            }
            other => panic!("expected deep links, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_extracts_and_reports_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body><h1 class='title'>Lamp</h1></body></html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let first = leased(&format!("{}/p/1", server.uri()));
        let second = leased(&format!("{}/p/2", server.uri()));
        let completed_id = first.id.clone();

        let mut api = MockJobApi::new();
        let mut batches = vec![Vec::new(), vec![first, second]];
        api.expect_allocate()
            .returning(move |_, _, _| Ok(batches.pop().unwrap_or_default()));
        api.expect_complete()
            .withf(move |ids: &[String]| ids.len() == 1 && ids[0] == completed_id)
            .times(1)
            .returning(|_| Ok(()));

        let store = Arc::new(MemoryStore::new());
        let crawl = CrawlLoop::new(
            Arc::new(api),
            Arc::new(StoreResultSink::new(store.clone())),
            settings(),
            ProxySettings::default(),
            "w1",
        );
        let rule = Rule::new("shop", "products", PRODUCT_PATTERN, &format!("{}/p/{{page}}", server.uri()), 2);

        let report = crawl.run(&rule, Instant::now() + Duration::from_secs(60)).await.unwrap();

        assert_eq!(report.allocated, 2);
        assert_eq!(report.records, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.given_up, 1);
        assert_eq!(store.count("products").await, 1);
    }

    #[tokio::test]
    async fn test_allocation_failure_aborts_loop() {
        let mut api = MockJobApi::new();
        api.expect_allocate()
            .returning(|_, _, _| Err(crate::api::ApiError::Status { status: 500, body: "down".into() }));
        api.expect_complete().never();

        let crawl = CrawlLoop::new(
            Arc::new(api),
            Arc::new(StoreResultSink::new(Arc::new(MemoryStore::new()))),
            settings(),
            ProxySettings::default(),
            "w1",
        );
        let rule = Rule::new("shop", "products", PRODUCT_PATTERN, "http://x/{page}", 1);

        assert!(crawl.run(&rule, Instant::now() + Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_flush() {
        let sink = Arc::new(SlowSink::default());
        let buffer = Arc::new(ResultBuffer::new(sink.clone(), "products", false));
        let identity = Arc::new(IdentityManager::new(ProxySettings::default()).unwrap());
        let background = BackgroundTasks::start(
            identity,
            Arc::clone(&buffer),
            None,
            &ProxySettings::default(),
            Duration::from_millis(100),
        );

        buffer.push_record(ExtractionRecord::new("http://x/1", Record::new()));
        // The periodic flush has taken the record and is still writing it
        sleep(Duration::from_millis(250)).await;
        assert_eq!(buffer.pending_records(), 0);

        background.shutdown().await;
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_page_is_retried_then_given_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>captcha</body></html>"))
            .expect(3)
            .mount(&server)
            .await;

        let mut api = MockJobApi::new();
        let mut batches = vec![Vec::new(), vec![leased(&format!("{}/p/1", server.uri()))]];
        api.expect_allocate()
            .returning(move |_, _, _| Ok(batches.pop().unwrap_or_default()));
        api.expect_complete().never();

        let store = Arc::new(MemoryStore::new());
        let crawl = CrawlLoop::new(
            Arc::new(api),
            Arc::new(StoreResultSink::new(store.clone())),
            WorkerSettings {
                write_layout_errors: true,
                ..settings()
            },
            ProxySettings::default(),
            "w1",
        );
        let rule = Rule::new("shop", "products", PRODUCT_PATTERN, &format!("{}/p/{{page}}", server.uri()), 1);

        let report = crawl.run(&rule, Instant::now() + Duration::from_secs(60)).await.unwrap();

        assert_eq!(report.allocated, 1);
        assert_eq!(report.records, 0);
        assert_eq!(report.completed, 0);
        assert_eq!(report.given_up, 1);
        assert_eq!(store.count("products").await, 0);
        assert_eq!(store.count(LAYOUT_ERRORS).await, 3);
    }
}
