use anyhow::{Result, Context};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Proxy};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::WorkerSettings;
use crate::lease::Rule;
use crate::proxy::IdentityManager;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

/// Why a fetch produced no page
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure: refused, reset, timed out or proxy unreachable
    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP status {0}")]
    Http(u16),
}

/// Body of a page answered with a non-error status
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// HTTP client of one crawl loop.
///
/// Every request goes out through the identity's current proxy and cookie.
pub struct Fetcher {
    client: Client,
    identity: Arc<IdentityManager>,
    delay_max: Duration,
}

impl Fetcher {
    pub fn build(rule: &Rule, identity: Arc<IdentityManager>, settings: &WorkerSettings) -> Result<Self> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
        for (name, value) in rule.request_headers() {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("Ignoring invalid header {} on rule {}", name, rule.id),
            }
        }

        // Rotated proxies must not reuse connections opened through the previous one
        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout.max(1)))
            .pool_max_idle_per_host(0);

        if identity.proxies_enabled() {
            let selector = Arc::clone(&identity);
            builder = builder.proxy(Proxy::custom(move |_| {
                selector.proxy_head().and_then(|proxy| Url::parse(&proxy).ok())
            }));
        }

        let client = builder
            .build()
            .context(format!("Failed to create HTTP client for rule {}", rule.id))?;

        Ok(Self {
            client,
            identity,
            delay_max: Duration::from_millis(settings.request_delay_max),
        })
    }

    /// Fetch a page after a random politeness delay
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if !self.delay_max.is_zero() {
            let delay = rand::thread_rng().gen_range(0..=self.delay_max.as_millis() as u64);
            sleep(Duration::from_millis(delay)).await;
        }

        // Blocks while the pool is empty
        self.identity.current_proxy().await;

        let mut request = self.client.get(url);
        let cookie = self.identity.cookie();
        if !cookie.is_empty() {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        self.identity.merge_set_cookies(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );

        if status >= 400 {
            debug!("{} answered {}", url, status);
            return Err(FetchError::Http(status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        Ok(FetchedPage {
            url: url.to_string(),
            status,
            body,
        })
    }
}
