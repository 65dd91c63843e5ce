use anyhow::{Result, Context};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system.
///
/// `RUST_LOG` directives are honoured on top of the crate level picked by `verbose`.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { "lease_crawler=debug" } else { "lease_crawler=info" };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive("warn".parse()?);

    let fmt_layer = fmt::layer().with_target(true);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {:?}", parent))?;
        }

        let file = fs::File::create(&log_file)
            .context(format!("Failed to create log file: {:?}", log_file))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}
