use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ltc_sync::{CollectOptions, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ltc-cli")]
#[command(about = "Ontario long-term care home data collector and API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect one source, resuming from its checkpoint.
    Collect {
        source: String,
        /// Ignore any checkpoint and start from the first home.
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        max_items: Option<usize>,
    },
    /// Write the metrics source's home list from the location listing.
    Discover,
    /// Reconcile both collected sources into the merged dataset.
    Merge,
    /// Collect every enabled source, merge, and refresh the cache.
    Sync,
    /// Wait for a running collection to finish, then merge.
    Monitor {
        source: String,
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },
    /// Serve the JSON API.
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Collect {
            source,
            fresh,
            max_items,
        } => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            let summary = pipeline
                .collect_source(&source, CollectOptions { fresh, max_items })
                .await?;
            println!(
                "collect complete: source={} total={} successful={} failed={} output={}",
                summary.source_id, summary.total, summary.successful, summary.failed, summary.output_path
            );
        }
        Commands::Discover => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            let list = pipeline.discover_home_list().await?;
            println!("discover complete: homes={}", list.homes.len());
        }
        Commands::Merge => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            let outcome = pipeline.merge().await?;
            println!(
                "merge complete: homes={} matched={} metrics_only={} location_only={} output={}",
                outcome.dataset.total_homes,
                outcome.report.matched,
                outcome.report.metrics_only,
                outcome.report.location_only,
                outcome.merged_path.display()
            );
        }
        Commands::Sync => {
            let summary = ltc_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} homes={} merged={} cache={}",
                summary.run_id, summary.total_homes, summary.merged_path, summary.cache_path
            );
        }
        Commands::Monitor { source, poll_secs } => {
            let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
            pipeline
                .wait_for_completion(&source, Duration::from_secs(poll_secs.max(1)))
                .await?;
            let outcome = pipeline.merge().await?;
            println!(
                "monitor complete: homes={} output={}",
                outcome.dataset.total_homes,
                outcome.merged_path.display()
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::from_config(SyncConfig::from_env()).await?);
            let scheduler = match pipeline.maybe_build_scheduler().await? {
                Some(sched) => {
                    sched.start().await.context("starting sync scheduler")?;
                    info!(cron = %pipeline.config().sync_cron, "sync scheduler started");
                    Some(sched)
                }
                None => None,
            };

            ltc_web::serve_from_env().await?;

            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
        }
    }

    Ok(())
}
