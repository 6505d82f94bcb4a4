//! smtp2amqp
//!
//! Bridges mail submission to a message queue.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                  smtp2amqp                    │
//!                     │                                              │
//!   SMTP client       │  ┌────────────┐   ┌─────────┐   ┌─────────┐  │
//!   ──────────────────┼─▶│    smtp    │──▶│ backend │──▶│  amqp   │──┼──▶ Broker
//!                     │  │  service   │   │         │   │ manager │  │
//!                     │  └────────────┘   └─────────┘   └────┬────┘  │
//!                     │                                      │ probe │
//!                     │                                      ▼       │
//!   Health probe      │  ┌────────────┐   ┌─────────────────────┐    │
//!   ──────────────────┼─▶│    http    │──▶│  health aggregator  │    │
//!                     │  └────────────┘   └─────────────────────┘    │
//!                     │                                              │
//!                     │  lifecycle: runner + shutdown coordinator    │
//!                     └──────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use smtp2amqp::config::load_config;
use smtp2amqp::lifecycle::{startup, ShutdownCoordinator};
use smtp2amqp::observability::{logging, metrics};
use smtp2amqp::LapinDialer;

#[derive(Parser)]
#[command(name = "smtp2amqp")]
#[command(about = "Accept mail over SMTP and publish it to an AMQP queue", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "configs/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init(&config.observability.log_level)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "smtp2amqp starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = ShutdownCoordinator::install();
    startup::run(config, &LapinDialer::new(), &shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
