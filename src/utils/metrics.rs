use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::info;

/// Crawl counters shared by the fetch tasks of one crawl loop
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Counter snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub start_time: DateTime<Utc>,

    pub total_requests: usize,

    pub successful_requests: usize,

    pub failed_requests: usize,

    /// Failures by HTTP status, 0 for connection errors
    pub failures_by_status: BTreeMap<u16, usize>,

    pub bytes_downloaded: usize,

    /// Sum of request durations in milliseconds
    pub total_duration_ms: u64,

    /// Records extracted
    pub records: usize,

    pub wrong_pages: usize,

    pub invalid_pages: usize,

    /// Detail pages queued from listing pages
    pub deep_links: usize,

    pub requeues: usize,

    pub give_ups: usize,
}

/// Terminal outcome of one page, for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    Record,
    WrongPage,
    Invalid,
    DeepLinks(usize),
    Requeued,
    GaveUp,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a finished request; `status` is `None` for connection errors
    pub async fn record_request(&self, success: bool, duration_ms: u64, status: Option<u16>, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_requests += 1;
        metrics.total_duration_ms += duration_ms;
        metrics.bytes_downloaded += bytes;

        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
            *metrics.failures_by_status.entry(status.unwrap_or(0)).or_default() += 1;
        }
    }

    pub async fn record_page(&self, event: PageEvent) {
        let mut metrics = self.metrics.lock().await;

        match event {
            PageEvent::Record => metrics.records += 1,
            PageEvent::WrongPage => metrics.wrong_pages += 1,
            PageEvent::Invalid => metrics.invalid_pages += 1,
            PageEvent::DeepLinks(count) => metrics.deep_links += count,
            PageEvent::Requeued => metrics.requeues += 1,
            PageEvent::GaveUp => metrics.give_ups += 1,
        }
    }

    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Log a one-line summary of the counters
    pub async fn log_summary(&self, label: &str) {
        let metrics = self.get_metrics().await;
        let elapsed = (Utc::now() - metrics.start_time).num_seconds().max(1);
        let average_ms = if metrics.total_requests > 0 {
            metrics.total_duration_ms / metrics.total_requests as u64
        } else {
            0
        };

        info!(
            "{}: {} requests ({} ok, {} failed {:?}) in {}s, avg {}ms, {} records, {} wrong pages, {} invalid, {} deep links, {} requeues, {} given up",
            label,
            metrics.total_requests,
            metrics.successful_requests,
            metrics.failed_requests,
            metrics.failures_by_status,
            elapsed,
            average_ms,
            metrics.records,
            metrics.wrong_pages,
            metrics.invalid_pages,
            metrics.deep_links,
            metrics.requeues,
            metrics.give_ups,
        );
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
