use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use url::Url;
use uuid::Uuid;

use crate::extract::{DeepLinkPattern, PatternError, PatternNode};
use crate::storage::StoreError;

/// Placeholder expanded into page numbers by link generation
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Lifecycle of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuleStatus {
    #[default]
    Active,
    Cancelled,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "Active",
            RuleStatus::Cancelled => "Cancelled",
        }
    }
}

/// Lease state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LinkStatus {
    #[default]
    Active,
    Running,
    Completed,
    Cancelled,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "Active",
            LinkStatus::Running => "Running",
            LinkStatus::Completed => "Completed",
            LinkStatus::Cancelled => "Cancelled",
        }
    }
}

/// Declarative scraping job definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub status: RuleStatus,

    /// Serialized extraction pattern tree
    #[serde(default)]
    pub pattern: String,

    #[serde(default, alias = "priorty")]
    pub priority: i32,

    /// Result collection the records of this rule are written to
    #[serde(default)]
    pub target_location: String,

    /// URL template containing the `{page}` placeholder
    #[serde(default)]
    pub link_pattern: String,

    /// Listing-page selector fragments, see [`DeepLinkPattern`]
    #[serde(
        default,
        alias = "deeplinkPatterns",
        deserialize_with = "deserialize_fragments"
    )]
    pub deep_link_pattern: Vec<String>,

    #[serde(default)]
    pub total_pages: u32,

    /// Serialized JSON object of request headers
    #[serde(default)]
    pub headers: String,

    /// Seconds between link regenerations, 0 for a one-shot rule
    #[serde(default)]
    pub frequency: u64,

    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub last_update: DateTime<Utc>,

    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_generated: Option<DateTime<Utc>>,
}

/// Accepts either a JSON list of fragments or the comma-separated legacy form
fn deserialize_fragments<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Fragments {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Fragments>::deserialize(deserializer)? {
        Some(Fragments::List(list)) => list,
        Some(Fragments::Joined(joined)) if !joined.trim().is_empty() => {
            joined.split(',').map(str::to_string).collect()
        }
        _ => Vec::new(),
    })
}

impl Rule {
    /// Create a new active rule with a fresh ID
    pub fn new(name: &str, target_location: &str, pattern: &str, link_pattern: &str, total_pages: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: RuleStatus::Active,
            pattern: pattern.to_string(),
            priority: 0,
            target_location: target_location.to_string(),
            link_pattern: link_pattern.to_string(),
            deep_link_pattern: Vec::new(),
            total_pages,
            headers: String::new(),
            frequency: 0,
            last_update: Utc::now(),
            last_generated: None,
        }
    }

    /// Check the fields a worker cannot operate without
    pub fn validate(&self) -> Result<(), StoreError> {
        let missing: Vec<&str> = [
            ("id", self.id.is_empty()),
            ("pattern", self.pattern.is_empty()),
            ("targetLocation", self.target_location.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, is_missing)| is_missing.then_some(name))
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::InvalidInput(format!(
                "rule is missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    /// Expand the link pattern for pages `1..=total_pages`
    pub fn generate_links(&self) -> Result<Vec<String>, StoreError> {
        if !self.link_pattern.contains(PAGE_PLACEHOLDER) {
            return Err(StoreError::InvalidInput(format!(
                "link pattern of rule {} has no {} placeholder",
                self.id, PAGE_PLACEHOLDER
            )));
        }

        Ok((1..=self.total_pages)
            .map(|page| self.link_pattern.replace(PAGE_PLACEHOLDER, &page.to_string()))
            .collect())
    }

    /// Parse the extraction pattern into its typed tree
    pub fn parsed_pattern(&self) -> Result<PatternNode, PatternError> {
        PatternNode::parse(&self.pattern)
    }

    /// Parse the deep-link fragments, `None` when the rule has no listing pass
    pub fn parsed_deep_links(&self) -> Result<Option<DeepLinkPattern>, PatternError> {
        DeepLinkPattern::parse(&self.deep_link_pattern)
    }

    /// Request headers; malformed JSON yields no headers
    pub fn request_headers(&self) -> HashMap<String, String> {
        if self.headers.trim().is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&self.headers).unwrap_or_default()
    }

    /// Scheme and host of the target site, used to validate proxies
    pub fn origin(&self) -> Option<String> {
        let sample = self.link_pattern.replace(PAGE_PLACEHOLDER, "1");
        let url = Url::parse(&sample).ok()?;
        url.host_str()?;
        Some(url.origin().ascii_serialization())
    }

    /// Whether the regeneration timer should (re)generate this rule's links
    pub fn generation_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
        match self.last_generated {
            None => true,
            Some(_) if self.frequency == 0 => false,
            Some(last) => now.signed_duration_since(last).num_seconds() >= self.frequency as i64,
        }
    }
}

/// One crawlable unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub id: String,

    pub link: String,

    #[serde(default)]
    pub status: LinkStatus,

    /// Lease holder, empty unless the link is running
    #[serde(default, alias = "scraper")]
    pub worker: String,

    #[serde(rename = "ruleID")]
    pub rule_id: String,

    #[serde(rename = "lastUpdate", with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub last_update: DateTime<Utc>,
}

impl Link {
    /// Create a new active link for a rule
    pub fn new(link: &str, rule_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            link: link.to_string(),
            status: LinkStatus::Active,
            worker: String::new(),
            rule_id: rule_id.to_string(),
            last_update: Utc::now(),
        }
    }

    /// The lease invariant: a worker is recorded exactly while running
    pub fn lease_consistent(&self) -> bool {
        (self.status == LinkStatus::Running) == !self.worker.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_links() {
        let rule = Rule::new("pages", "results", "{}", "http://x/{page}", 3);

        let links = rule.generate_links().unwrap();

        assert_eq!(links, vec!["http://x/1", "http://x/2", "http://x/3"]);
    }

    #[test]
    fn test_generate_links_requires_placeholder() {
        let rule = Rule::new("pages", "results", "{}", "http://x/list", 3);
        assert!(rule.generate_links().is_err());
    }

    #[test]
    fn test_rule_accepts_legacy_fields() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "name": "shop",
            "pattern": "{}",
            "priorty": 2,
            "targetLocation": "products",
            "linkPattern": "https://shop.example/list?page={page}",
            "deeplinkPatterns": "div.item,span.name,a,removeQueryString",
            "totalPages": 4,
            "headers": "{\"accept-language\": \"en\"}"
        }))
        .unwrap();

        assert_eq!(rule.priority, 2);
        assert_eq!(rule.deep_link_pattern, vec!["div.item", "span.name", "a", "removeQueryString"]);
        assert_eq!(rule.request_headers().get("accept-language").map(String::as_str), Some("en"));
        assert_eq!(rule.origin().as_deref(), Some("https://shop.example"));
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rule_deep_links_as_list() {
        let rule: Rule = serde_json::from_value(json!({
            "deepLinkPattern": ["ul li", "b", "a"]
        }))
        .unwrap();

        assert_eq!(rule.deep_link_pattern.len(), 3);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_generation_due() {
        let now = Utc::now();
        let mut rule = Rule::new("r", "t", "{}", "http://x/{page}", 1);
        assert!(rule.generation_due(now));

        rule.last_generated = Some(now);
        assert!(!rule.generation_due(now));

        rule.frequency = 60;
        assert!(!rule.generation_due(now + chrono::Duration::seconds(59)));
        assert!(rule.generation_due(now + chrono::Duration::seconds(60)));

        rule.status = RuleStatus::Cancelled;
        assert!(!rule.generation_due(now + chrono::Duration::seconds(600)));
    }

    #[test]
    fn test_link_serializes_epoch_millis() {
        let link = Link::new("http://x/1", "r1");
        let value = serde_json::to_value(&link).unwrap();

        assert_eq!(value["ruleID"], "r1");
        assert_eq!(value["status"], "Active");
        assert!(value["lastUpdate"].is_i64());
        assert!(link.lease_consistent());
    }
}
