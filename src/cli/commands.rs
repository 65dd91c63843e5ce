use anyhow::{Result, Context};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{HttpJobApi, JobApi, LocalJobApi};
use crate::cli::config::CrawlerConfig;
use crate::crawler::Orchestrator;
use crate::lease::server;
use crate::lease::{AppState, LeaseStore, MaintenanceJobs, Rule};
use crate::storage::{DocumentStoreFactory, Page, ResultSink, StoreResultSink};

async fn open_lease_store(config: &CrawlerConfig) -> Result<Arc<LeaseStore>> {
    let documents = DocumentStoreFactory::create(&config.storage)
        .await
        .context("Failed to open the document store")?;

    Ok(Arc::new(LeaseStore::with_selection_sample(
        documents,
        config.lease.selection_sample,
    )))
}

/// Rule commands against the memory backend only touch this process
async fn open_admin_store(config: &CrawlerConfig) -> Result<Arc<LeaseStore>> {
    if config.storage.backend == "memory" {
        warn!("Storage backend is 'memory', changes will not outlive this command");
    }
    open_lease_store(config).await
}

fn app_state(config: &CrawlerConfig, store: Arc<LeaseStore>) -> AppState {
    AppState {
        store,
        page_size: config.storage.page_size,
        batch_size: config.worker.batch_size,
    }
}

/// Serve the job API until the process stops
pub async fn serve(config: &CrawlerConfig) -> Result<()> {
    let store = open_lease_store(config).await?;
    let _jobs = MaintenanceJobs::start(Arc::clone(&store), &config.lease);

    server::serve(&config.api, app_state(config, store)).await
}

/// Run crawl rounds against the remote job API
pub async fn work(mut config: CrawlerConfig, once: bool, rule: Option<String>) -> Result<()> {
    if rule.is_some() {
        config.worker.rule_id = rule;
    }

    let api: Arc<dyn JobApi> = Arc::new(HttpJobApi::new(&config.api).context("Failed to create job API client")?);
    let documents = DocumentStoreFactory::create(&config.storage)
        .await
        .context("Failed to open the result store")?;
    let sink: Arc<dyn ResultSink> = Arc::new(StoreResultSink::new(documents));

    Orchestrator::new(api, sink, config.worker, config.proxy).run(once).await
}

/// Serve the job API and crawl against it in the same process
pub async fn run(config: CrawlerConfig, once: bool) -> Result<()> {
    let store = open_lease_store(&config).await?;
    let _jobs = MaintenanceJobs::start(Arc::clone(&store), &config.lease);

    let api: Arc<dyn JobApi> = Arc::new(LocalJobApi::new(Arc::clone(&store)));
    let documents = DocumentStoreFactory::create(&config.storage)
        .await
        .context("Failed to open the result store")?;
    let sink: Arc<dyn ResultSink> = Arc::new(StoreResultSink::new(documents));
    let orchestrator = Orchestrator::new(api, sink, config.worker.clone(), config.proxy.clone());

    tokio::select! {
        served = server::serve(&config.api, app_state(&config, store)) => served,
        crawled = orchestrator.run(once) => crawled,
    }
}

fn read_rule(path: &Path) -> Result<Rule> {
    let contents = std::fs::read_to_string(path)
        .context(format!("Failed to read rule file: {}", path.display()))?;

    let is_json = path.extension().map_or(false, |ext| ext == "json");
    let rule = if is_json {
        serde_json::from_str(&contents).context(format!("Failed to parse rule file: {}", path.display()))?
    } else {
        serde_yaml::from_str(&contents).context(format!("Failed to parse rule file: {}", path.display()))?
    };

    Ok(rule)
}

/// Create or update a rule from a file
pub async fn add_rule(config: &CrawlerConfig, file: &Path, generate: bool) -> Result<()> {
    let rule = read_rule(file)?;
    rule.parsed_pattern()
        .context(format!("Rule {} has an invalid extraction pattern", rule.name))?;
    rule.parsed_deep_links()
        .context(format!("Rule {} has an invalid deep link pattern", rule.name))?;

    let store = open_admin_store(config).await?;
    let rule = store.upsert_rule(rule).await.context("Failed to store rule")?;
    println!("Rule stored with ID: {}", rule.id);

    if generate {
        let count = store.generate_links(&rule.id).await?;
        println!("Generated {} links", count);
    }

    Ok(())
}

/// List stored rules
pub async fn list_rules(config: &CrawlerConfig, page: usize) -> Result<()> {
    let store = open_admin_store(config).await?;
    let rules = store
        .list_rules(Page::numbered(page, config.storage.page_size))
        .await?;

    if rules.is_empty() {
        println!("No rules found");
        return Ok(());
    }

    for rule in rules {
        let generated = rule
            .last_generated
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        println!(
            "{}  {:<9}  {}  -> {}  ({} pages, every {}s, generated {})",
            rule.id,
            rule.status.as_str(),
            rule.name,
            rule.target_location,
            rule.total_pages,
            rule.frequency,
            generated
        );
    }

    Ok(())
}

/// Cancel the rule's unfinished links and lay out fresh ones
pub async fn generate_links(config: &CrawlerConfig, rule_id: &str) -> Result<()> {
    let store = open_admin_store(config).await?;
    let count = store
        .generate_links(rule_id)
        .await
        .context(format!("Failed to generate links for rule {}", rule_id))?;

    println!("Generated {} links for rule {}", count, rule_id);
    Ok(())
}

/// Cancel a rule and its unfinished links
pub async fn cancel_rule(config: &CrawlerConfig, rule_id: &str) -> Result<()> {
    let store = open_admin_store(config).await?;
    let cancelled = store
        .cancel_rule(rule_id)
        .await
        .context(format!("Failed to cancel rule {}", rule_id))?;

    println!("Rule {} cancelled, {} links cancelled", rule_id, cancelled);
    Ok(())
}

/// Show the links of a rule with their lease state
pub async fn show_links(config: &CrawlerConfig, rule_id: &str, page: usize) -> Result<()> {
    let store = open_admin_store(config).await?;
    let links = store
        .links_for_rule(rule_id, Page::numbered(page, config.storage.page_size))
        .await?;

    for link in &links {
        let worker = if link.worker.is_empty() { "-" } else { link.worker.as_str() };
        println!(
            "{}  {:<9}  {}  {}  {}",
            link.id,
            link.status.as_str(),
            worker,
            link.last_update.to_rfc3339(),
            link.link
        );
    }
    info!("{} links shown", links.len());

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &CrawlerConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}

/// Write a profile populated with defaults
pub fn init_profile(name: &str) -> Result<()> {
    let path = CrawlerConfig::default().save_as_profile(name)?;
    println!("Profile '{}' written to {}", name, path.display());
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    if profiles.is_empty() {
        println!("No configuration profiles found");
    } else {
        println!("Available profiles:");
        for profile in profiles {
            println!("  - {}", profile);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_rule_from_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "name: lamps\ntargetLocation: products\nlinkPattern: \"http://shop.test/list/{{page}}\"\ntotalPages: 3\npattern: '{{\"title\": {{\"pattern\": \"h1\", \"value\": \"text\"}}}}'\ndeepLinkPattern: \"li.item,span,a\""
        )
        .unwrap();

        let rule = read_rule(file.path()).unwrap();

        assert_eq!(rule.name, "lamps");
        assert_eq!(rule.total_pages, 3);
        assert_eq!(rule.deep_link_pattern, vec!["li.item", "span", "a"]);
        assert!(rule.parsed_pattern().is_ok());
    }

    #[test]
    fn test_read_rule_from_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"name": "lamps", "targetLocation": "products", "linkPattern": "http://x/{{page}}", "totalPages": 2}}"#
        )
        .unwrap();

        let rule = read_rule(file.path()).unwrap();

        assert_eq!(rule.link_pattern, "http://x/{page}");
        assert!(rule.id.is_empty());
    }
}
