//! Routeway server binary.
//!
//! Loads the TOML config, installs logging and metrics, and serves the
//! built-in routes until Ctrl+C or SIGTERM.

use std::path::PathBuf;

use clap::Parser;

use routeway::config::load_config;
use routeway::lifecycle::{signals, Shutdown};
use routeway::observability::{logging, metrics};
use routeway::{App, RoutewayConfig};

#[derive(Parser, Debug)]
#[command(name = "routeway", version, about = "Request pipeline server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ROUTEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RoutewayConfig::default(),
    };

    logging::init_logging(Some(&config.observability.log_filter));
    tracing::info!(
        name = %config.app.name,
        environment = %config.app.environment,
        version = env!("CARGO_PKG_VERSION"),
        "routeway starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        store = ?config.store.kind,
        rpc_enabled = config.rpc.enabled,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    signals::install(shutdown.clone());

    App::new(config).run(shutdown).await?;
    Ok(())
}
