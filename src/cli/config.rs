use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error, warn};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub lease: LeaseSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Job API settings, shared by the coordinator and the workers
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL workers use to reach the coordinator
    pub distributor_url: String,
    /// Address the coordinator listens on
    pub bind_address: String,
    /// Allowed CORS origins, empty for any
    pub cors_origins: Vec<String>,
    /// Job API request timeout in seconds
    pub request_timeout: u64,
}

/// Worker process settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Crawl loops started per round
    pub instances: usize,
    /// Concurrent fetches per crawl loop
    pub threads: usize,
    /// Links requested per allocation
    pub batch_size: usize,
    /// Graceful runtime per crawl loop in seconds
    pub max_runtime: u64,
    /// Extra time before a crawl loop is cut off, in seconds
    pub shutdown_grace: u64,
    /// Upper bound of the random start delay in seconds
    pub start_stagger: u64,
    /// Requeues before a URL is dropped
    pub give_up_after: u32,
    pub cooldown_min: u64,
    pub cooldown_max: u64,
    /// Upper bound of the random per-request delay in milliseconds
    pub request_delay_max: u64,
    /// Per-request timeout in seconds
    pub request_timeout: u64,
    /// Seconds between result flushes
    pub flush_interval: u64,
    /// Record page-layout diagnostics
    pub write_layout_errors: bool,
    /// Pin the worker to one rule
    pub rule_id: Option<String>,
    /// Sleep after a failed round in seconds
    pub round_backoff: u64,
}

/// Proxy and identity settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub protocol: String, // "socks5", "http", "https"
    /// Source of the raw `host:port` list
    pub list_url: String,
    /// Seconds between identity refreshes
    pub refresh_interval: u64,
    /// Per-candidate validation timeout in seconds
    pub validation_timeout: u64,
    /// Candidates validated at once
    pub validation_concurrency: usize,
    /// Minimum seconds between rotations
    pub min_dwell: u64,
    /// Failures that force a rotation regardless of dwell
    pub failure_threshold: u32,
    /// Milliseconds between checks while the pool is empty
    pub wait_poll: u64,
}

/// Coordinator lease settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LeaseSettings {
    /// Running links older than this many seconds are reclaimed
    pub reclaim_after: u64,
    /// Seconds between reclaim sweeps
    pub sweep_interval: u64,
    /// Seconds between checks for rules due for link generation
    pub generation_interval: u64,
    /// Active links sampled when a worker asks for any rule
    pub selection_sample: usize,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String, // "memory", "mongodb"
    pub connection_string: String,
    pub database_name: String,
    /// Page size of paginated listings
    pub page_size: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            distributor_url: "http://localhost:9999/api/v1/dist".to_string(),
            bind_address: "0.0.0.0:9999".to_string(),
            cors_origins: vec![],
            request_timeout: 30,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            instances: 3,
            threads: 20,
            batch_size: 100,
            max_runtime: 900,
            shutdown_grace: 60,
            start_stagger: 10,
            give_up_after: 12,
            cooldown_min: 10,
            cooldown_max: 120,
            request_delay_max: 5000,
            request_timeout: 30,
            flush_interval: 60,
            write_layout_errors: false,
            rule_id: None,
            round_backoff: 60,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: "socks5".to_string(),
            list_url: "https://api.proxyscrape.com/v2/?request=getproxies&protocol=socks5&timeout=10000&country=all".to_string(),
            refresh_interval: 180,
            validation_timeout: 10,
            validation_concurrency: 200,
            min_dwell: 10,
            failure_threshold: 10,
            wait_poll: 1000,
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            reclaim_after: 3600,
            sweep_interval: 300,
            generation_interval: 60,
            selection_sample: 100,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            connection_string: "mongodb://localhost:27017".to_string(),
            database_name: "crawler".to_string(),
            page_size: 100,
        }
    }
}

impl WorkerSettings {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval.max(1))
    }
}

impl ProxySettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(1))
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout.max(1))
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs(self.min_dwell)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll.max(10))
    }
}

impl LeaseSettings {
    pub fn reclaim_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reclaim_after as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs(self.generation_interval.max(1))
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "lease-crawler", "lease-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the profiles directory if it doesn't exist
        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load configuration from an explicit file, a named profile, or the default
    pub fn load(path: Option<&Path>, profile: Option<&str>) -> Result<Self> {
        let mut config = match (path, profile) {
            (Some(path), _) => Self::load_from_file(path)?,
            (None, Some(profile)) => Self::load_profile(profile)?,
            (None, None) => Self::load_default()?,
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("profiles").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply the deployment environment variables on top of the file settings
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = var("DISTRIBUTOR_API") {
            self.api.distributor_url = url.trim_end_matches('/').to_string();
        }

        if let Some(source) = var("PROXY_API") {
            match source.split_once('%') {
                Some((protocol, list_url)) if !protocol.is_empty() && !list_url.is_empty() => {
                    self.proxy.protocol = protocol.to_string();
                    self.proxy.list_url = list_url.to_string();
                    self.proxy.enabled = true;
                }
                _ => warn!("Ignoring PROXY_API, expected '<protocol>%<url>'"),
            }
        }

        if let Some(threads) = var("THREADS") {
            match threads.trim().parse::<usize>() {
                Ok(threads) if threads > 0 => self.worker.threads = threads,
                _ => warn!("Ignoring invalid THREADS value: {}", threads),
            }
        }

        if var("WRITEPAGELAYOUTERROR").is_some() {
            self.worker.write_layout_errors = true;
        }

        if let Some(uri) = var("CONNECTION_URI") {
            self.storage.backend = "mongodb".to_string();
            self.storage.connection_string = uri;
        }

        if let Some(name) = var("DATABASE_NAME") {
            self.storage.database_name = name;
        }

        if let Some(port) = var("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => {
                    let host = self
                        .api
                        .bind_address
                        .rsplit_once(':')
                        .map(|(host, _)| host.to_string())
                        .unwrap_or_else(|| "0.0.0.0".to_string());
                    self.api.bind_address = format!("{}:{}", host, port);
                }
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }

        if let Some(origins) = var("CORS") {
            self.api.cors_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<PathBuf> {
        let profile_path = Self::config_dir().join("profiles").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)?;
        Ok(profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let profiles_dir = Self::config_dir().join("profiles");

        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(profiles_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        fs::write(&path, "worker:\n  instances: 1\n  threads: 4\nstorage:\n  backend: mongodb\n").unwrap();

        let config = CrawlerConfig::load_from_file(&path).unwrap();

        assert_eq!(config.worker.instances, 1);
        assert_eq!(config.worker.threads, 4);
        assert_eq!(config.worker.give_up_after, 12);
        assert_eq!(config.storage.backend, "mongodb");
        assert_eq!(config.storage.page_size, 100);
        assert_eq!(config.lease.reclaim_after, 3600);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = CrawlerConfig::default();
        config.worker.rule_id = Some("r1".to_string());

        config.save_to_file(&path).unwrap();
        let loaded = CrawlerConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.worker.rule_id.as_deref(), Some("r1"));
        assert_eq!(loaded.api.distributor_url, config.api.distributor_url);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DISTRIBUTOR_API", "http://coordinator:9999/api/v1/dist/"),
            ("PROXY_API", "http%http://proxies.example/list"),
            ("THREADS", "8"),
            ("WRITEPAGELAYOUTERROR", "1"),
            ("CONNECTION_URI", "mongodb://db:27017"),
            ("DATABASE_NAME", "scraping"),
            ("PORT", "8080"),
            ("CORS", "http://a.example, http://b.example"),
        ]);
        let mut config = CrawlerConfig::default();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api.distributor_url, "http://coordinator:9999/api/v1/dist");
        assert!(config.proxy.enabled);
        assert_eq!(config.proxy.protocol, "http");
        assert_eq!(config.proxy.list_url, "http://proxies.example/list");
        assert_eq!(config.worker.threads, 8);
        assert!(config.worker.write_layout_errors);
        assert_eq!(config.storage.backend, "mongodb");
        assert_eq!(config.storage.database_name, "scraping");
        assert_eq!(config.api.bind_address, "0.0.0.0:8080");
        assert_eq!(config.api.cors_origins, vec!["http://a.example", "http://b.example"]);
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = CrawlerConfig::default();

        config.apply_overrides(|key| match key {
            "PROXY_API" => Some("no-separator".to_string()),
            "THREADS" => Some("many".to_string()),
            "PORT" => Some("".to_string()),
            _ => None,
        });

        assert!(!config.proxy.enabled);
        assert_eq!(config.worker.threads, 20);
        assert_eq!(config.api.bind_address, "0.0.0.0:9999");
    }
}
