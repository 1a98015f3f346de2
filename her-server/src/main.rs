//! her server - Main entry point.

use anyhow::Result;
use her_common::config::Config;
use her_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (.env, optional JSON file, environment)
    let (config, report) = Config::load_with_env()?;

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&config.observability);

    tracing::info!("her server v{}", env!("CARGO_PKG_VERSION"));
    report.log();

    her_server::start_server(&config).await
}
