use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shoptrends_sync::{
    client_scheduler, maybe_build_scheduler, LogNotifier, SyncConfig, SyncPipeline,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shoptrends-cli")]
#[command(about = "Affiliate product catalog sync")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Overrides {
    /// Catalog size cap.
    #[arg(long, global = true)]
    max_items: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh every enabled catalog once and write the published snapshot.
    Sync {
        #[arg(long)]
        catalogs: Option<PathBuf>,
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Run the batch sync on a cron schedule until Ctrl-C.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        catalogs: Option<PathBuf>,
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Poll a published feed into a local cache until Ctrl-C.
    Watch {
        /// Feed URL or local path.
        #[arg(long)]
        feed: Option<String>,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn apply_paths(config: &mut SyncConfig, catalogs: Option<PathBuf>, snapshot: Option<PathBuf>) {
    if let Some(catalogs) = catalogs {
        config.catalogs_path = catalogs;
    }
    if let Some(snapshot) = snapshot {
        config.snapshot_path = snapshot;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(max_items) = cli.overrides.max_items {
        config.max_items = max_items;
    }

    match cli.command.unwrap_or(Commands::Sync {
        catalogs: None,
        snapshot: None,
    }) {
        Commands::Sync { catalogs, snapshot } => {
            apply_paths(&mut config, catalogs, snapshot);
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} catalogs={} added={} updated={} skipped={} total={}{}",
                summary.run_id,
                summary.catalogs,
                summary.added,
                summary.updated,
                summary.skipped,
                summary.total,
                if summary.persisted { "" } else { " (snapshot unchanged)" }
            );
        }
        Commands::Schedule {
            cron,
            catalogs,
            snapshot,
        } => {
            apply_paths(&mut config, catalogs, snapshot);
            if let Some(cron) = cron {
                config.sync_cron = cron;
            }
            config.scheduler_enabled = true;

            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "batch scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Watch {
            feed,
            cache,
            interval_secs,
        } => {
            if let Some(feed) = feed {
                config.feed_url = feed;
            }
            if let Some(cache) = cache {
                config.cache_path = cache;
            }
            if let Some(secs) = interval_secs.filter(|secs| *secs > 0) {
                config.poll_interval_secs = secs;
            }

            let scheduler = client_scheduler(&config, Arc::new(LogNotifier))?;
            let mut states = scheduler.subscribe();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    debug!(?state, "sync state");
                }
            });
            scheduler.start();
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("stopping after the current cycle");
            scheduler.stop().await;
        }
    }

    Ok(())
}
