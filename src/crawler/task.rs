use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::extract::Record;

/// Collection page-layout diagnostics are written to
pub const LAYOUT_ERRORS: &str = "PageLayoutError";

/// Deepest page a crawl loop follows (seeds are depth 1)
pub const MAX_DEPTH: u32 = 2;

/// A URL waiting to be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub url: String,

    /// 1 for allocated links, one more for each deep-link hop
    pub depth: u32,
}

impl FetchTarget {
    pub fn seed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            depth: 1,
        }
    }
}

/// Structured result of one successfully extracted page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// Fields produced by the extraction pattern
    #[serde(flatten)]
    pub fields: Record,

    // Serialized after the flattened fields so pattern keys of the same
    // name cannot replace them
    pub id: String,

    /// Source URL
    pub link: String,

    #[serde(rename = "lastUpdate", with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

impl ExtractionRecord {
    pub fn new(link: &str, fields: Record) -> Self {
        Self {
            fields,
            id: Uuid::new_v4().to_string(),
            link: link.to_string(),
            last_update: Utc::now(),
        }
    }
}

/// Snapshot of a page whose layout did not match the rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutDiagnostic {
    pub id: String,

    pub link: String,

    /// Cookie sent with the request
    pub cookie: String,

    pub html: String,

    #[serde(rename = "lastUpdate", with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

impl LayoutDiagnostic {
    pub fn new(link: &str, cookie: &str, html: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            link: link.to_string(),
            cookie: cookie.to_string(),
            html,
            last_update: Utc::now(),
        }
    }
}
