use anyhow::{Result, Context};
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, SET_COOKIE, USER_AGENT};
use reqwest::Client;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use crate::cli::config::ProxySettings;

const VALIDATION_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Extra aggregate validation budget per candidate
const PER_CANDIDATE_BUDGET: Duration = Duration::from_millis(20);

/// Mutable identity of one worker
#[derive(Debug, Default)]
struct IdentityState {
    /// Validated `protocol://host:port` proxies, head in use
    pool: Vec<String>,

    /// Cookies captured while validating proxies
    jar: Vec<String>,

    /// Cookie header sent with every request
    cookie: String,

    /// Failures since the last rotation
    failures: u32,

    last_rotation: Option<Instant>,
}

/// Proxy pool and cookie identity shared by all fetches of a crawl loop.
///
/// The state sits behind a synchronous mutex that is never held across an
/// await, so the HTTP client's proxy selector can read it directly.
pub struct IdentityManager {
    settings: ProxySettings,
    state: Mutex<IdentityState>,
    client: Client,
}

impl IdentityManager {
    /// Create a new identity manager with an empty pool
    pub fn new(settings: ProxySettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.validation_timeout() * 3)
            .build()
            .context("Failed to create proxy list client")?;

        Ok(Self {
            settings,
            state: Mutex::new(IdentityState::default()),
            client,
        })
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn proxies_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Head of the pool without waiting
    pub fn proxy_head(&self) -> Option<String> {
        self.lock().pool.first().cloned()
    }

    pub fn pool_size(&self) -> usize {
        self.lock().pool.len()
    }

    /// Proxy to use for the next request.
    ///
    /// Waits for a refresh while the pool is empty; `None` when proxies are disabled.
    pub async fn current_proxy(&self) -> Option<String> {
        if !self.settings.enabled {
            return None;
        }

        let mut waited = false;
        loop {
            if let Some(proxy) = self.proxy_head() {
                return Some(proxy);
            }
            if !waited {
                info!("Waiting for the proxy pool to be refilled");
                waited = true;
            }
            sleep(self.settings.wait_poll()).await;
        }
    }

    /// Cookie header value for the next request
    pub fn cookie(&self) -> String {
        self.lock().cookie.clone()
    }

    /// Merge `set-cookie` values into the current cookie, replacing same-name entries
    pub fn merge_set_cookies<I, S>(&self, set_cookies: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let incoming: Vec<(String, String)> = set_cookies
            .into_iter()
            .filter_map(|header| cookie_pair(header.as_ref()))
            .collect();
        if incoming.is_empty() {
            return;
        }

        let mut state = self.lock();
        let mut pairs: Vec<(String, String)> = state
            .cookie
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        for (name, value) in incoming {
            match pairs.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => entry.1 = value,
                None => pairs.push((name, value)),
            }
        }

        state.cookie = join_pairs(&pairs);
        debug!("Current cookie: {}", state.cookie);
    }

    /// Record a failure and rotate the identity when allowed.
    ///
    /// Rotation happens once the dwell time since the previous rotation has
    /// passed or the failure count reaches the threshold. The last proxy in
    /// the pool is never dropped. Returns whether a rotation happened.
    pub fn rotate_on_failure(&self, rotate_proxy: bool, rotate_cookie: bool) -> bool {
        let mut state = self.lock();
        state.failures += 1;

        let dwell_passed = state
            .last_rotation
            .map_or(true, |at| at.elapsed() >= self.settings.min_dwell());
        if !dwell_passed && state.failures < self.settings.failure_threshold {
            return false;
        }

        let mut rotated = false;
        if rotate_proxy && state.pool.len() > 1 {
            let dropped = state.pool.remove(0);
            debug!("Dropped proxy {}", dropped);
            rotated = true;
        }
        if rotate_cookie && !state.jar.is_empty() {
            state.cookie = state.jar.remove(0);
            rotated = true;
        }

        state.failures = 0;
        state.last_rotation = Some(Instant::now());

        if rotated {
            info!(
                "Identity changed, proxies: {} cookies: {}",
                state.pool.len(),
                state.jar.len()
            );
        }
        rotated
    }

    /// Replace the pool and jar with freshly validated entries
    pub fn replace(&self, pool: Vec<String>, jar: Vec<String>) {
        let mut state = self.lock();
        state.pool = pool;
        state.jar = jar;
    }

    /// Fetch the proxy list, validate every candidate against `test_url`,
    /// and replace the pool and cookie jar wholesale.
    ///
    /// Returns the number of validated proxies.
    pub async fn refresh(&self, test_url: &str) -> Result<usize> {
        if !self.settings.enabled {
            return Ok(0);
        }

        debug!("Getting proxies from {}", self.settings.list_url);
        let body = self
            .client
            .get(&self.settings.list_url)
            .send()
            .await
            .context(format!("Failed to fetch proxy list from {}", self.settings.list_url))?
            .error_for_status()
            .context("Proxy list source returned an error")?
            .text()
            .await
            .context("Failed to read proxy list")?;

        let candidates: Vec<String> = parse_proxy_list(&body)
            .into_iter()
            .map(|entry| format!("{}://{}", self.settings.protocol, entry))
            .collect();

        let (pool, jar) = self.validate(candidates.clone(), test_url).await;
        let validated = pool.len();
        info!(
            "Proxies: {} validated: {} cookies: {}",
            candidates.len(),
            validated,
            jar.len()
        );

        self.replace(pool, jar);
        Ok(validated)
    }

    /// Validate candidates concurrently, keeping those answering below 300
    async fn validate(&self, candidates: Vec<String>, test_url: &str) -> (Vec<String>, Vec<String>) {
        let per_candidate = self.settings.validation_timeout();
        let budget = per_candidate.max(PER_CANDIDATE_BUDGET * candidates.len() as u32);
        let deadline = Instant::now() + per_candidate + budget;
        debug!("Validating {} proxies, it could take {:?}", candidates.len(), per_candidate + budget);

        let mut checks = stream::iter(candidates)
            .map(|candidate| validate_candidate(candidate, test_url, per_candidate))
            .buffer_unordered(self.settings.validation_concurrency.max(1));

        let mut pool = Vec::new();
        let mut jar = Vec::new();
        loop {
            match timeout_at(deadline, checks.next()).await {
                Ok(Some(Some((proxy, cookie)))) => {
                    pool.push(proxy);
                    if let Some(cookie) = cookie {
                        jar.push(cookie);
                    }
                }
                Ok(Some(None)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!("Proxy validation deadline passed, keeping {} proxies", pool.len());
                    break;
                }
            }
        }

        (pool, jar)
    }
}

/// Check a single proxy, returning it with any cookie the target handed out
async fn validate_candidate(proxy_url: String, test_url: &str, per_candidate: Duration) -> Option<(String, Option<String>)> {
    let proxy = reqwest::Proxy::all(&proxy_url).ok()?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(per_candidate)
        .default_headers(validation_headers())
        .build()
        .ok()?;

    let response = client.get(test_url).send().await.ok()?;
    if response.status().as_u16() >= 300 {
        return None;
    }

    let set_cookies: Vec<&str> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let cookie = cookie_header(&set_cookies);

    Some((proxy_url, (!cookie.is_empty()).then_some(cookie)))
}

fn validation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(VALIDATION_USER_AGENT));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en;q=0.9,en-US;q=0.8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=100"));
    headers
}

/// Split a raw proxy list on CRLF or LF, dropping blank lines
pub fn parse_proxy_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `name=value` part of one `set-cookie` header
fn cookie_pair(header: &str) -> Option<(String, String)> {
    let first = header.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cookie header built from a list of `set-cookie` values
pub fn cookie_header(set_cookies: &[&str]) -> String {
    let pairs: Vec<(String, String)> = set_cookies.iter().filter_map(|header| cookie_pair(header)).collect();
    join_pairs(&pairs)
}
