//! Counsel Gateway - Main entry point.

use anyhow::Result;
use counsel_common::config::Config;
use counsel_common::logging::init_logging;
use counsel_common::Validate;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;
    config.validate()?;

    // Initialize logging
    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("Counsel Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Start the gateway server
    counsel_gateway::start_server(&config).await
}
