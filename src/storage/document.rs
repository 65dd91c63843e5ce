use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Errors surfaced by a document store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single predicate applied to one document field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Lt(Value),
    Ne(Value),
}

impl Condition {
    /// Evaluate the predicate against a field value (missing fields are `Null`)
    pub fn matches(&self, field: &Value) -> bool {
        match self {
            Condition::Eq(expected) => field == expected,
            Condition::Ne(expected) => field != expected,
            Condition::In(candidates) => candidates.iter().any(|c| c == field),
            Condition::Lt(bound) => compare_values(field, bound) == Some(Ordering::Less),
        }
    }
}

/// Orders two JSON scalars of the same kind; mixed kinds are incomparable
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Conjunction of field predicates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn ne(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), Condition::Ne(value.into())));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), Condition::Lt(value.into())));
        self
    }

    pub fn within<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push((field.to_string(), Condition::In(values)));
        self
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    /// True when every condition holds for the document
    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            let value = document.get(field).unwrap_or(&Value::Null);
            condition.matches(value)
        })
    }
}

/// Pagination window for `find`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Page {
    /// No skip, no limit
    pub fn all() -> Self {
        Self { skip: 0, limit: None }
    }

    /// First `limit` documents
    pub fn first(limit: usize) -> Self {
        Self { skip: 0, limit: Some(limit) }
    }

    /// 1-based page number; page 0 means unlimited
    pub fn numbered(page: usize, page_size: usize) -> Self {
        if page == 0 {
            return Self::all();
        }
        Self {
            skip: (page - 1) * page_size,
            limit: Some(page_size),
        }
    }
}

/// Document persistence collaborator used by the lease store and result sink.
///
/// Documents are JSON objects keyed by an `id` field; backends are free to
/// map that onto their native primary key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find documents matching the filter, in insertion order
    async fn find(&self, collection: &str, filter: &Filter, page: Page) -> StoreResult<Vec<Value>>;

    /// Insert all documents or none
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> StoreResult<()>;

    /// Set the given fields on every matching document, returning the match count
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> StoreResult<u64>;

    /// Replace the fields of the first matching document, inserting it when absent
    async fn upsert_one(&self, collection: &str, filter: &Filter, document: Value) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_conditions() {
        let doc = json!({"id": "a", "status": "Running", "lastUpdate": 100});

        assert!(Filter::new().eq("status", "Running").matches(&doc));
        assert!(!Filter::new().eq("status", "Active").matches(&doc));
        assert!(Filter::new().ne("status", "Completed").matches(&doc));
        assert!(Filter::new().within("id", ["a", "b"]).matches(&doc));
        assert!(!Filter::new().within("id", ["c"]).matches(&doc));
        assert!(Filter::new().lt("lastUpdate", 101).matches(&doc));
        assert!(!Filter::new().lt("lastUpdate", 100).matches(&doc));

        // Missing fields compare as null
        assert!(Filter::new().ne("worker", "w1").matches(&doc));
        assert!(!Filter::new().lt("missing", 5).matches(&doc));
    }

    #[test]
    fn test_numbered_pages() {
        assert_eq!(Page::numbered(0, 10), Page::all());
        assert_eq!(Page::numbered(1, 10), Page { skip: 0, limit: Some(10) });
        assert_eq!(Page::numbered(3, 10), Page { skip: 20, limit: Some(10) });
    }
}
