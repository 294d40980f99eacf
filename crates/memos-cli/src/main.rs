use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memos_sync::{maybe_build_scheduler, MirrorConfig, SyncFrequency, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "memos-cli")]
#[command(about = "Mirror memos into a local markdown vault")]
struct Cli {
    /// YAML config file (defaults to ./memos-sync.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and exit.
    Sync,
    /// Sync now, then keep syncing on the configured schedule until interrupted.
    Watch,
    /// Validate configuration without touching the network.
    CheckConfig,
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{level},reqwest=warn,hyper=warn").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = MirrorConfig::load(cli.config.as_deref())?;
    init_logging(&config.log_level);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(&config)?;
            match pipeline.run_once().await {
                Ok(summary) => println!(
                    "sync complete: run_id={} synced={} skipped={} failed={} digests={}",
                    summary.run_id,
                    summary.written(),
                    summary.skipped_existing,
                    summary.failed,
                    summary.digests_written
                ),
                Err(err) => {
                    eprintln!("sync failed: {err:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Watch => {
            config.sync_frequency = SyncFrequency::Auto;
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
            if let Err(err) = pipeline.run_once().await {
                warn!(error = %format!("{err:#}"), "initial sync failed");
            }

            let mut sched = maybe_build_scheduler(&config, pipeline.clone())
                .await?
                .context("scheduler unexpectedly disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(
                cron = ?config.sync_cron,
                interval_minutes = config.auto_sync_interval_minutes,
                "watching for changes; press ctrl-c to stop"
            );

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            println!("watch stopped");
        }
        Commands::CheckConfig => {
            config.validate()?;
            let tz = config.tz()?;
            println!(
                "config ok: api_url={} token=set vault={} sync_dir={} limit={} timezone={} ai={}",
                config.api_url,
                config.vault_root.display(),
                config.sync_root().display(),
                config.sync_limit,
                tz,
                if config.ai.enabled {
                    format!("{:?}/{}", config.ai.backend, config.ai.resolved_model())
                } else {
                    "disabled".to_string()
                }
            );
        }
    }

    Ok(())
}
