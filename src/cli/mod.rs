pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use config::CrawlerConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, overrides the default profile
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Named configuration profile
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job API with its reclaim and regeneration timers
    Serve,

    /// Run crawl rounds against a remote job API
    Work {
        /// Stop after a single round
        #[arg(long)]
        once: bool,

        /// Only crawl this rule
        #[arg(short, long)]
        rule: Option<String>,
    },

    /// Run the job API and the workers in one process
    Run {
        /// Stop after a single crawl round
        #[arg(long)]
        once: bool,
    },

    /// Manage scraping rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Show or manage configuration profiles
    Config {
        /// Write a profile with default settings
        #[arg(long)]
        init: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Create or update a rule from a JSON or YAML file
    Add {
        #[arg(short, long)]
        file: PathBuf,

        /// Generate the rule's links right away
        #[arg(short, long)]
        generate: bool,
    },

    /// List rules
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
    },

    /// Regenerate the links of a rule
    Generate {
        #[arg(required = true)]
        rule_id: String,
    },

    /// Cancel a rule and its unfinished links
    Cancel {
        #[arg(required = true)]
        rule_id: String,
    },

    /// Show the links of a rule
    Links {
        #[arg(required = true)]
        rule_id: String,

        #[arg(long, default_value_t = 1)]
        page: usize,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init, list } = &cli.command {
        return if *list {
            info!("Listing all configuration profiles");
            commands::list_profiles()
        } else if let Some(name) = init {
            info!("Writing default configuration profile: {}", name);
            commands::init_profile(name)
        } else {
            let config = CrawlerConfig::load(cli.config.as_deref(), cli.profile.as_deref())?;
            commands::show_config(&config)
        };
    }

    let config = CrawlerConfig::load(cli.config.as_deref(), cli.profile.as_deref())?;

    match cli.command {
        Commands::Serve => {
            info!("Starting job API on {}", config.api.bind_address);
            commands::serve(&config).await
        }
        Commands::Work { once, rule } => {
            info!("Starting workers against {}", config.api.distributor_url);
            commands::work(config, once, rule).await
        }
        Commands::Run { once } => {
            info!("Starting job API and workers");
            commands::run(config, once).await
        }
        Commands::Rule { action } => match action {
            RuleAction::Add { file, generate } => {
                info!("Upserting rule from {:?}", file);
                commands::add_rule(&config, &file, generate).await
            }
            RuleAction::List { page } => commands::list_rules(&config, page).await,
            RuleAction::Generate { rule_id } => {
                info!("Generating links for rule {}", rule_id);
                commands::generate_links(&config, &rule_id).await
            }
            RuleAction::Cancel { rule_id } => {
                info!("Cancelling rule {}", rule_id);
                commands::cancel_rule(&config, &rule_id).await
            }
            RuleAction::Links { rule_id, page } => commands::show_links(&config, &rule_id, page).await,
        },
        Commands::Config { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_work_with_global_options() {
        let cli = Cli::try_parse_from(["crawler", "work", "--once", "--rule", "r1", "-v"]).unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Work { once, rule } => {
                assert!(once);
                assert_eq!(rule.as_deref(), Some("r1"));
            }
            _ => panic!("expected the work command"),
        }
    }
}
