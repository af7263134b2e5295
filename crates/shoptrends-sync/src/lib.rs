//! Catalog sync: batch refresh across catalogs, the merge engine and the
//! client polling scheduler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shoptrends_adapters::{feed_source_for, normalize_batch, FeedSource, NormalizedBatch};
use shoptrends_core::{CategoryFallback, Snapshot};
use shoptrends_storage::{HttpClientConfig, HttpFetcher, JsonFileStore, SnapshotStore};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;
pub mod scheduler;

pub use merge::{
    apply_retention, merge, merge_batch, Catalog, MergeReport, RetentionPolicy, Upsert,
    DEFAULT_MAX_ITEMS,
};
pub use scheduler::{
    CycleError, CycleOutcome, LogNotifier, Notifier, SchedulerConfig, SyncScheduler, SyncState,
    SyncStatus,
};

pub const CRATE_NAME: &str = "shoptrends-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRegistry {
    pub catalogs: Vec<CatalogConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub slug: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Feed URL or local export path.
    pub feed: String,
}

fn default_enabled() -> bool {
    true
}

impl CatalogConfig {
    pub fn category(&self) -> CategoryFallback {
        CategoryFallback {
            slug: self.slug.clone(),
            name: self.name.clone(),
        }
    }
}

impl CatalogRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CatalogConfig> {
        self.catalogs.iter().filter(|c| c.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot_path: PathBuf,
    pub catalogs_path: PathBuf,
    pub max_items: usize,
    pub feed_url: String,
    pub cache_path: PathBuf,
    pub poll_interval_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            snapshot_path: std::env::var("SHOPTRENDS_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/products.json")),
            catalogs_path: std::env::var("SHOPTRENDS_CATALOGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./catalogs.yaml")),
            max_items: std::env::var("SHOPTRENDS_MAX_ITEMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_ITEMS),
            feed_url: std::env::var("SHOPTRENDS_FEED_URL")
                .unwrap_or_else(|_| "./products.json".to_string()),
            cache_path: std::env::var("SHOPTRENDS_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/cache_items.json")),
            poll_interval_secs: std::env::var("SHOPTRENDS_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(3600),
            scheduler_enabled: std::env::var("SHOPTRENDS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SHOPTRENDS_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            user_agent: std::env::var("SHOPTRENDS_USER_AGENT")
                .unwrap_or_else(|_| "shoptrends-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("SHOPTRENDS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_items: self.max_items,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_items: self.max_items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalogs: usize,
    pub fetched_records: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub total: usize,
    /// False when no valid offer arrived and the snapshot was left alone.
    pub persisted: bool,
}

/// One feed plus the category its records fall back to.
pub struct CatalogFeed {
    pub category: CategoryFallback,
    pub source: Arc<dyn FeedSource>,
}

pub struct SyncPipeline {
    store: Arc<dyn SnapshotStore>,
    feeds: Vec<CatalogFeed>,
    retention: RetentionPolicy,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        feeds: Vec<CatalogFeed>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            feeds,
            retention,
        }
    }

    /// Wire the pipeline from the catalog registry and a JSON snapshot file.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = CatalogRegistry::load(&config.catalogs_path).await?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let feeds = registry
            .enabled()
            .map(|catalog| CatalogFeed {
                category: catalog.category(),
                source: feed_source_for(&catalog.feed, Arc::clone(&http)),
            })
            .collect::<Vec<_>>();
        if feeds.is_empty() {
            warn!(path = %config.catalogs_path.display(), "no enabled catalogs");
        }
        Ok(Self::new(
            Arc::new(JsonFileStore::new(config.snapshot_path.clone())),
            feeds,
            config.retention(),
        ))
    }

    pub fn catalogs(&self) -> usize {
        self.feeds.len()
    }

    /// Fetch every catalog, merge into the stored snapshot and persist it.
    /// Any feed failure aborts the run before the snapshot is touched.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, catalogs = self.feeds.len());
        self.run_inner(run_id, started_at).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let previous = self
            .store
            .load()
            .await
            .context("loading previous snapshot")?;
        let previous_len = previous.len();

        let mut batch = NormalizedBatch::default();
        let mut fetched_records = 0usize;
        for feed in &self.feeds {
            let raw = feed.source.fetch_feed(run_id).await.with_context(|| {
                format!(
                    "fetching catalog {} from {}",
                    feed.category.slug,
                    feed.source.location()
                )
            })?;
            fetched_records += raw.items.len();
            let normalized = normalize_batch(&raw.items, Some(&feed.category));
            info!(
                catalog = %feed.category.slug,
                records = raw.items.len(),
                accepted = normalized.drafts.len(),
                skipped = normalized.skipped,
                "catalog fetched"
            );
            batch.extend(normalized);
        }

        let report = merge_batch(previous.items, batch, started_at);
        let MergeReport {
            items,
            added,
            updated,
            skipped,
        } = report;

        let (total, persisted) = if added + updated == 0 {
            warn!(skipped, "no valid offers in any catalog; snapshot left untouched");
            (previous_len, false)
        } else {
            let snapshot = Snapshot::new(Utc::now(), self.retention.apply(items));
            self.store
                .save(&snapshot)
                .await
                .context("writing snapshot")?;
            (snapshot.len(), true)
        };

        info!(added, updated, skipped, total, "sync run complete");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            catalogs: self.feeds.len(),
            fetched_records,
            added,
            updated,
            skipped,
            total,
            persisted,
        })
    }
}

/// Holds the cron in-flight flag for one tick and clears it on drop, so a
/// run that panics or is cancelled does not block later ticks.
struct TickGuard(Arc<AtomicBool>);

impl TickGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cron-driven batch runs. Returns `None` unless the scheduler is enabled.
/// A tick that fires while the previous run is still going is skipped.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(AtomicBool::new(false));
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Some(_tick) = TickGuard::acquire(&in_flight) else {
                warn!("previous scheduled sync still running; skipping tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.added,
                    total = summary.total,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Client scheduler polling the configured feed into the local cache.
pub fn client_scheduler(config: &SyncConfig, notifier: Arc<dyn Notifier>) -> Result<SyncScheduler> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    Ok(SyncScheduler::new(
        feed_source_for(&config.feed_url, http),
        Arc::new(JsonFileStore::new(config.cache_path.clone())),
        notifier,
        config.scheduler_config(),
    ))
}
