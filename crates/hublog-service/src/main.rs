//! hublog service - background device-state collector.
//!
//! Run with: `cargo run -p hublog-service`

use std::path::PathBuf;

use clap::Parser;
use time::OffsetDateTime;
use tracing::info;

use hublog_service::{Collector, Config, ControllerClient};
use hublog_store::hour_floor;

/// Collect controller state history into hour-partitioned log files.
#[derive(Parser, Debug)]
#[command(name = "hublog-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Event log root directory (overrides config).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Raw snapshot directory (overrides config).
    #[arg(long)]
    snapshot_root: Option<PathBuf>,

    /// Merge pending history windows, then exit.
    #[arg(long)]
    backfill_only: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("hublog_service={level}").parse()?)
                .add_directive(format!("hublog_store={level}").parse()?),
        )
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    // Override config with CLI args
    if let Some(root) = args.root {
        config.storage.log_root = root;
    }
    if let Some(snapshot_root) = args.snapshot_root {
        config.storage.snapshot_root = Some(snapshot_root);
    }
    config.validate()?;

    let client = ControllerClient::new(&config.controller)?
        .minimal_response(config.collector.minimal_response)
        .no_attributes(config.collector.no_attributes)
        .significant_only(config.collector.significant_only);
    let collector = Collector::new(client, &config);

    if args.backfill_only {
        info!("Merging pending history windows, then exiting");
        collector
            .merge_pending(hour_floor(OffsetDateTime::now_utc()))
            .await?;
        return Ok(());
    }

    info!(
        root = %config.storage.log_root.display(),
        "Starting collector"
    );
    collector.run().await;

    Ok(())
}
