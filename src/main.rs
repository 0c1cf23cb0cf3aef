// Trellis server entrypoint
//!
//! The heavy lifting (initialization, server wiring, graceful shutdown)
//! lives in dedicated modules so this file remains a thin orchestrator.

mod config;
mod lifecycle;
mod logging;

use anyhow::Result;
use config::AppConfig;
use log::info;

#[actix_web::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    // Logging before any other side effects
    logging::init_logging(&config.logging)?;

    info!("Trellis v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "host: {}  port: {}  development: {}",
        config.server.host, config.server.port, config.server.development
    );

    let components = lifecycle::bootstrap(&config).await?;
    lifecycle::run(&config, components).await
}
