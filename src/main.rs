//! blobtail: tail append-style logs out of a blob container.

use blobtail::error::{AddressParseSnafu, AppError, ConfigSnafu, MetricsSnafu};
use blobtail::{Config, metrics, signal};
use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Incremental blob container log ingester.
#[derive(Parser, Debug)]
#[command(name = "blobtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate configuration and exit.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // Events go to stdout, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("blobtail starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Container: {}", config.storage.container);
        info!("Prefixes: {:?}", config.source.path_prefixes);
        match &config.checkpoint {
            Some(checkpoint) => info!("Checkpoint table: {}", checkpoint.table),
            None => info!("No checkpoint table, using leases"),
        }
        info!("Configuration is valid");
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let shutdown = CancellationToken::new();
    signal::cancel_on_signal(shutdown.clone());

    blobtail::run(config, shutdown).await
}
