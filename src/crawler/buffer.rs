use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

use super::task::{ExtractionRecord, LayoutDiagnostic, LAYOUT_ERRORS};
use crate::storage::{ResultSink, StoreResult};

#[derive(Debug, Default)]
struct Pending {
    records: Vec<Value>,
    diagnostics: Vec<Value>,
}

/// In-memory buffer of results waiting for the next flush.
///
/// Fetch tasks push into it concurrently; the periodic flusher and the final
/// flush at the end of a crawl loop drain it. A failed write puts the batch
/// back so the next flush retries it.
pub struct ResultBuffer {
    sink: Arc<dyn ResultSink>,
    target_location: String,
    keep_diagnostics: bool,
    pending: Mutex<Pending>,
}

impl ResultBuffer {
    pub fn new(sink: Arc<dyn ResultSink>, target_location: &str, keep_diagnostics: bool) -> Self {
        Self {
            sink,
            target_location: target_location.to_string(),
            keep_diagnostics,
            pending: Mutex::new(Pending::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_record(&self, record: ExtractionRecord) {
        match serde_json::to_value(record) {
            Ok(value) => self.lock().records.push(value),
            Err(e) => error!("Failed to serialize record: {}", e),
        }
    }

    /// Keep a wrong-page snapshot, ignored unless diagnostics are enabled
    pub fn push_diagnostic(&self, diagnostic: LayoutDiagnostic) {
        if !self.keep_diagnostics {
            return;
        }
        match serde_json::to_value(diagnostic) {
            Ok(value) => self.lock().diagnostics.push(value),
            Err(e) => error!("Failed to serialize layout diagnostic: {}", e),
        }
    }

    pub fn pending_records(&self) -> usize {
        self.lock().records.len()
    }

    pub fn pending_diagnostics(&self) -> usize {
        self.lock().diagnostics.len()
    }

    /// Write everything buffered so far, returning the number of records stored.
    ///
    /// Only a failed record write is an error. Diagnostics that could not be
    /// written are kept for the next flush.
    pub async fn flush(&self) -> StoreResult<usize> {
        let (records, diagnostics) = {
            let mut pending = self.lock();
            (
                std::mem::take(&mut pending.records),
                std::mem::take(&mut pending.diagnostics),
            )
        };

        let stored = records.len();
        if !records.is_empty() {
            if let Err(e) = self.sink.insert_many(&self.target_location, records.clone()).await {
                self.restore(records, diagnostics);
                return Err(e);
            }
            debug!("Flushed {} records to {}", stored, self.target_location);
        }

        if !diagnostics.is_empty() {
            if let Err(e) = self.sink.insert_many(LAYOUT_ERRORS, diagnostics.clone()).await {
                warn!("Failed to store {} layout diagnostics: {}", diagnostics.len(), e);
                self.restore(Vec::new(), diagnostics);
            }
        }

        Ok(stored)
    }

    fn restore(&self, records: Vec<Value>, diagnostics: Vec<Value>) {
        let mut pending = self.lock();
        let newer_records = std::mem::replace(&mut pending.records, records);
        pending.records.extend(newer_records);
        let newer_diagnostics = std::mem::replace(&mut pending.diagnostics, diagnostics);
        pending.diagnostics.extend(newer_diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Record;
    use crate::storage::results::MockResultSink;
    use crate::storage::{MemoryStore, StoreError, StoreResultSink};
    use serde_json::json;

    fn record(link: &str) -> ExtractionRecord {
        let mut fields = Record::new();
        fields.insert("title".to_string(), json!({"value": "x"}));
        ExtractionRecord::new(link, fields)
    }

    #[tokio::test]
    async fn test_flush_writes_records_and_diagnostics() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(StoreResultSink::new(store.clone()));
        let buffer = ResultBuffer::new(sink, "results", true);

        buffer.push_record(record("http://x/1"));
        buffer.push_record(record("http://x/2"));
        buffer.push_diagnostic(LayoutDiagnostic::new("http://x/3", "", "<html/>".into()));

        assert_eq!(buffer.flush().await.unwrap(), 2);
        assert_eq!(store.count("results").await, 2);
        assert_eq!(store.count(LAYOUT_ERRORS).await, 1);

        // Nothing left to write
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(store.count("results").await, 2);
    }

    #[tokio::test]
    async fn test_diagnostics_dropped_when_disabled() {
        let store = Arc::new(MemoryStore::new());
        let buffer = ResultBuffer::new(Arc::new(StoreResultSink::new(store.clone())), "results", false);

        buffer.push_diagnostic(LayoutDiagnostic::new("http://x/3", "", "<html/>".into()));
        buffer.flush().await.unwrap();

        assert_eq!(store.count(LAYOUT_ERRORS).await, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_records() {
        let mut sink = MockResultSink::new();
        let mut calls = 0;
        sink.expect_insert_many().times(2).returning(move |_, records| {
            calls += 1;
            if calls == 1 {
                Err(StoreError::Backend("down".into()))
            } else {
                assert_eq!(records.len(), 2);
                Ok(())
            }
        });
        let buffer = ResultBuffer::new(Arc::new(sink), "results", false);

        buffer.push_record(record("http://x/1"));
        assert!(buffer.flush().await.is_err());
        assert_eq!(buffer.pending_records(), 1);

        buffer.push_record(record("http://x/2"));
        assert_eq!(buffer.flush().await.unwrap(), 2);
        assert_eq!(buffer.pending_records(), 0);
    }

    #[tokio::test]
    async fn test_failed_diagnostics_do_not_fail_flush() {
        let mut sink = MockResultSink::new();
        let mut calls = 0;
        sink.expect_insert_many().times(3).returning(move |collection, records| {
            calls += 1;
            match calls {
                1 => {
                    assert_eq!(collection, "results");
                    Ok(())
                }
                2 => {
                    assert_eq!(collection, LAYOUT_ERRORS);
                    Err(StoreError::Backend("down".into()))
                }
                _ => {
                    assert_eq!(collection, LAYOUT_ERRORS);
                    assert_eq!(records.len(), 1);
                    Ok(())
                }
            }
        });
        let buffer = ResultBuffer::new(Arc::new(sink), "results", true);

        buffer.push_record(record("http://x/1"));
        buffer.push_diagnostic(LayoutDiagnostic::new("http://x/3", "", "<html/>".into()));

        assert_eq!(buffer.flush().await.unwrap(), 1);
        assert_eq!(buffer.pending_records(), 0);
        assert_eq!(buffer.pending_diagnostics(), 1);

        // Diagnostics go out with the next flush
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(buffer.pending_diagnostics(), 0);
    }
}
