use anyhow::Result;
use tracing::{info, error};

use lease_crawler::cli;
use lease_crawler::utils::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    init_logging(args.verbose, args.log_file.clone())?;
    info!("Starting lease-crawler v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
