//! Client-side polling scheduler.
//!
//! Each cycle reads the cached snapshot, fetches the published feed, merges,
//! persists and notifies. Cycles never overlap: a trigger that arrives while
//! one is in flight is dropped, and the next timer is armed only after the
//! current cycle completes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shoptrends_adapters::{AdapterError, FeedSource};
use shoptrends_core::{Item, Snapshot};
use shoptrends_storage::{SnapshotStore, StorageError};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merge::{apply_retention, merge, DEFAULT_MAX_ITEMS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Merging,
    Persisting,
    Notifying,
    Failed,
}

/// User-facing status line published after every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    NewItems(usize),
    NoNewItems,
    Unchanged,
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::NewItems(1) => f.write_str("1 new item"),
            SyncStatus::NewItems(n) => write!(f, "{n} new items"),
            SyncStatus::NoNewItems => f.write_str("no new items"),
            SyncStatus::Unchanged => f.write_str("catalog unchanged"),
            SyncStatus::Error(message) => write!(f, "sync failed: {message}"),
        }
    }
}

/// Presentation seam. The scheduler hands it the full catalog after a
/// successful persist, or just a status line otherwise.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn render(&self, items: &[Item], status: &SyncStatus);

    async fn status(&self, status: &SyncStatus);
}

/// Notifier that writes a summary to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn render(&self, items: &[Item], status: &SyncStatus) {
        let deals = items.iter().filter(|item| item.is_deal()).count();
        let newest = items.first().map(|item| item.title.as_str()).unwrap_or("-");
        info!(total = items.len(), deals, newest, "{status}");
    }

    async fn status(&self, status: &SyncStatus) {
        match status {
            SyncStatus::Error(_) => warn!("{status}"),
            _ => info!("{status}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("loading snapshot: {0}")]
    Load(#[source] StorageError),
    #[error("fetching feed: {0}")]
    Fetch(#[from] AdapterError),
    #[error("persisting snapshot: {0}")]
    Persist(#[source] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        added: usize,
        updated: usize,
        skipped: usize,
        total: usize,
    },
    /// The feed carried nothing valid; the snapshot was left alone.
    Unchanged { skipped: usize },
    Failed(String),
    /// Another cycle was already in flight.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_items: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

struct Inner {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    busy: AtomicBool,
    running: AtomicBool,
    state: watch::Sender<SyncState>,
}

/// Clears the in-flight flag and returns to `Idle` however the cycle ends.
struct BusyGuard<'a> {
    inner: &'a Inner,
}

impl<'a> BusyGuard<'a> {
    fn acquire(inner: &'a Inner) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inner })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.send_replace(SyncState::Idle);
        self.inner.busy.store(false, Ordering::Release);
    }
}

/// A spawned poll loop and its own shutdown signal, fresh for each `start`.
struct PollTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct SyncScheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<PollTask>>,
}

impl SyncScheduler {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            inner: Arc::new(Inner {
                feed,
                store,
                notifier,
                config,
                busy: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Run one cycle now, then keep polling. Returns `false` if the loop
    /// was already running.
    pub fn start(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scheduler already running");
            return false;
        }
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.inner), Arc::clone(&shutdown)));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(PollTask { handle, shutdown });
        true
    }

    /// Stop polling. An in-flight cycle runs to completion first.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(PollTask { handle, shutdown }) = task else {
            debug!("scheduler not running");
            return;
        };
        shutdown.notify_one();
        if let Err(err) = handle.await {
            warn!(error = %err, "poll loop ended abnormally");
        }
        self.inner.running.store(false, Ordering::Release);
    }

    /// The polling loop is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// A cycle is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Manual refresh. Returns [`CycleOutcome::Skipped`] if a cycle is
    /// already in flight.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }
}

async fn poll_loop(inner: Arc<Inner>, shutdown: Arc<Notify>) {
    info!(
        feed = inner.feed.location(),
        interval_secs = inner.config.poll_interval.as_secs(),
        "poll loop started"
    );
    loop {
        inner.run_cycle().await;
        tokio::select! {
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = shutdown.notified() => break,
        }
    }
    inner.running.store(false, Ordering::Release);
    info!("poll loop stopped");
}

impl Inner {
    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = BusyGuard::acquire(self) else {
            debug!("cycle already in flight; skipping trigger");
            return CycleOutcome::Skipped;
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id);
        async {
            match self.cycle(run_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.set_state(SyncState::Failed);
                    warn!(error = %err, "sync cycle failed; keeping previous snapshot");
                    let message = err.to_string();
                    self.notifier.status(&SyncStatus::Error(message.clone())).await;
                    CycleOutcome::Failed(message)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn cycle(&self, run_id: Uuid) -> Result<CycleOutcome, CycleError> {
        self.set_state(SyncState::Fetching);
        let previous = self.store.load().await.map_err(CycleError::Load)?;
        let feed = self.feed.fetch_feed(run_id).await?;
        debug!(records = feed.items.len(), "feed received");

        self.set_state(SyncState::Merging);
        let report = merge(previous.items, &feed.items, Utc::now());
        if report.is_noop() {
            info!(skipped = report.skipped, "no valid offers in feed");
            self.set_state(SyncState::Notifying);
            self.notifier.status(&SyncStatus::Unchanged).await;
            return Ok(CycleOutcome::Unchanged {
                skipped: report.skipped,
            });
        }
        let (added, updated, skipped) = (report.added, report.updated, report.skipped);
        let items = apply_retention(report.items, self.config.max_items);

        self.set_state(SyncState::Persisting);
        let snapshot = Snapshot::new(Utc::now(), items);
        self.store
            .save(&snapshot)
            .await
            .map_err(CycleError::Persist)?;

        self.set_state(SyncState::Notifying);
        let status = if added > 0 {
            SyncStatus::NewItems(added)
        } else {
            SyncStatus::NoNewItems
        };
        self.notifier.render(&snapshot.items, &status).await;

        info!(added, updated, skipped, total = snapshot.len(), "sync cycle complete");
        Ok(CycleOutcome::Completed {
            added,
            updated,
            skipped,
            total: snapshot.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};
    use shoptrends_adapters::RawFeed;
    use shoptrends_storage::MemoryStore;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    struct StaticFeed {
        items: Vec<JsonValue>,
        delay: Duration,
        calls: Mutex<Vec<(Instant, Instant)>>,
    }

    impl StaticFeed {
        fn new(items: Vec<JsonValue>) -> Self {
            Self::slow(items, Duration::ZERO)
        }

        fn slow(items: Vec<JsonValue>, delay: Duration) -> Self {
            Self {
                items,
                delay,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Instant, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedSource for StaticFeed {
        fn location(&self) -> &str {
            "static"
        }

        async fn fetch_feed(&self, _run_id: Uuid) -> Result<RawFeed, AdapterError> {
            let started = Instant::now();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.lock().unwrap().push((started, Instant::now()));
            Ok(RawFeed {
                updated_at: None,
                items: self.items.clone(),
            })
        }
    }

    #[derive(Default)]
    struct BrokenFeed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeedSource for BrokenFeed {
        fn location(&self) -> &str {
            "broken"
        }

        async fn fetch_feed(&self, _run_id: Uuid) -> Result<RawFeed, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::MissingItems)
        }
    }

    /// Loads a fixed snapshot and refuses every write.
    struct ReadOnlyStore {
        snapshot: Snapshot,
    }

    #[async_trait]
    impl SnapshotStore for ReadOnlyStore {
        async fn load(&self) -> Result<Snapshot, StorageError> {
            Ok(self.snapshot.clone())
        }

        async fn save(&self, _snapshot: &Snapshot) -> Result<(), StorageError> {
            Err(StorageError::Io {
                action: "writing",
                path: PathBuf::from("catalog.json"),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    struct GatedFeed {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl FeedSource for GatedFeed {
        fn location(&self) -> &str {
            "gated"
        }

        async fn fetch_feed(&self, _run_id: Uuid) -> Result<RawFeed, AdapterError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(RawFeed {
                updated_at: None,
                items: vec![offer("1", "Gated")],
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        renders: Mutex<Vec<(usize, SyncStatus)>>,
        statuses: Mutex<Vec<SyncStatus>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn render(&self, items: &[Item], status: &SyncStatus) {
            self.renders.lock().unwrap().push((items.len(), status.clone()));
        }

        async fn status(&self, status: &SyncStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }
    }

    fn offer(id: &str, title: &str) -> JsonValue {
        json!({"source": "x", "sourceId": id, "title": title, "price": 10})
    }

    fn scheduler(
        feed: Arc<dyn FeedSource>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    ) -> SyncScheduler {
        SyncScheduler::new(feed, store, notifier, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn cycle_persists_and_renders_new_items() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A"), offer("2", "B")]));
        let sched = scheduler(feed, store.clone(), notifier.clone());

        let outcome = sched.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                added: 2,
                updated: 0,
                skipped: 0,
                total: 2
            }
        );
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.updated_at.is_some());
        assert_eq!(
            notifier.renders.lock().unwrap().clone(),
            vec![(2, SyncStatus::NewItems(2))]
        );
        assert_eq!(sched.state(), SyncState::Idle);
        assert!(!sched.is_busy());
    }

    #[tokio::test]
    async fn repeat_cycle_reports_no_new_items_and_keeps_first_seen() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A")]));
        let sched = scheduler(feed, store.clone(), notifier.clone());

        sched.run_cycle().await;
        let first_seen = store.snapshot().await.items[0].first_seen_at;
        let outcome = sched.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Completed {
                added: 0,
                updated: 1,
                ..
            }
        ));
        assert_eq!(store.snapshot().await.items[0].first_seen_at, first_seen);
        assert_eq!(
            notifier.renders.lock().unwrap().last().cloned(),
            Some((1, SyncStatus::NoNewItems))
        );
    }

    #[tokio::test]
    async fn fetch_failure_keeps_snapshot_and_reports_error() {
        let store = Arc::new(MemoryStore::default());
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A")]));
        scheduler(feed, store.clone(), Arc::new(RecordingNotifier::default()))
            .run_cycle()
            .await;
        let seeded = store.snapshot().await;
        assert_eq!(seeded.len(), 1);

        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(
            Arc::new(BrokenFeed::default()),
            store.clone(),
            notifier.clone(),
        );

        let outcome = sched.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert_eq!(store.snapshot().await, seeded);
        assert!(notifier.renders.lock().unwrap().is_empty());
        let statuses = notifier.statuses.lock().unwrap().clone();
        assert_eq!(statuses.len(), 1);
        assert!(matches!(statuses[0], SyncStatus::Error(_)));
        assert_eq!(sched.state(), SyncState::Idle);
        assert!(!sched.is_busy());
    }

    #[tokio::test]
    async fn feed_without_valid_offers_leaves_catalog_unchanged() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A")]));
        scheduler(feed, store.clone(), Arc::new(RecordingNotifier::default()))
            .run_cycle()
            .await;
        let before = store.snapshot().await;

        let junk = Arc::new(StaticFeed::new(vec![json!({"title": "  "}), json!(null)]));
        let outcome = scheduler(junk, store.clone(), notifier.clone())
            .run_cycle()
            .await;

        assert_eq!(outcome, CycleOutcome::Unchanged { skipped: 2 });
        assert_eq!(store.snapshot().await, before);
        assert_eq!(
            notifier.statuses.lock().unwrap().clone(),
            vec![SyncStatus::Unchanged]
        );
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let gate = Arc::new(GatedFeed {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(MemoryStore::default());
        let sched = Arc::new(scheduler(
            gate.clone(),
            store.clone(),
            Arc::new(RecordingNotifier::default()),
        ));

        let first = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.run_cycle().await }
        });
        gate.entered.notified().await;
        assert!(sched.is_busy());
        assert_eq!(sched.state(), SyncState::Fetching);
        assert_eq!(sched.run_cycle().await, CycleOutcome::Skipped);

        gate.release.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed { added: 1, .. }));
        assert!(!sched.is_busy());
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn retention_caps_persisted_catalog() {
        let store = Arc::new(MemoryStore::default());
        let feed = Arc::new(StaticFeed::new(vec![
            offer("1", "A"),
            offer("2", "B"),
            offer("3", "C"),
        ]));
        let sched = SyncScheduler::new(
            feed,
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            SchedulerConfig {
                max_items: 2,
                ..SchedulerConfig::default()
            },
        );
        let outcome = sched.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Completed { added: 3, total: 2, .. }));
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_timer_waits_for_completion() {
        let interval = Duration::from_secs(2);
        let fetch_time = Duration::from_secs(5);
        let feed = Arc::new(StaticFeed::slow(vec![offer("1", "A")], fetch_time));
        let sched = SyncScheduler::new(
            feed.clone(),
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingNotifier::default()),
            SchedulerConfig {
                poll_interval: interval,
                max_items: 10,
            },
        );

        assert!(sched.start());
        assert!(!sched.start());
        assert!(sched.is_running());

        tokio::time::sleep(Duration::from_secs(20)).await;
        sched.stop().await;
        assert!(!sched.is_running());

        let calls = feed.calls();
        assert!(calls.len() >= 2, "expected several cycles, got {}", calls.len());
        for pair in calls.windows(2) {
            let (_, previous_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start >= previous_end + interval);
        }

        let settled = calls.len();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(feed.calls().len(), settled);
    }

    #[tokio::test]
    async fn persist_failure_keeps_snapshot_and_skips_render() {
        let seed = Arc::new(MemoryStore::default());
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A")]));
        scheduler(feed, seed.clone(), Arc::new(RecordingNotifier::default()))
            .run_cycle()
            .await;
        let store = Arc::new(ReadOnlyStore {
            snapshot: seed.snapshot().await,
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = SyncScheduler::new(
            Arc::new(StaticFeed::new(vec![offer("2", "B")])),
            store.clone(),
            notifier.clone(),
            SchedulerConfig::default(),
        );

        let CycleOutcome::Failed(message) = sched.run_cycle().await else {
            panic!("save error should fail the cycle");
        };
        assert!(message.starts_with("persisting snapshot"), "{message}");
        assert!(message.contains("disk full"), "{message}");
        assert!(notifier.renders.lock().unwrap().is_empty());
        let statuses = notifier.statuses.lock().unwrap().clone();
        assert_eq!(statuses, vec![SyncStatus::Error(message)]);
        assert_eq!(sched.state(), SyncState::Idle);
        assert!(!sched.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycles_keep_the_poll_loop_armed() {
        let feed = Arc::new(BrokenFeed::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = SyncScheduler::new(
            feed.clone(),
            Arc::new(MemoryStore::default()),
            notifier.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_secs(2),
                max_items: 10,
            },
        );

        assert!(sched.start());
        tokio::time::sleep(Duration::from_secs(11)).await;

        let calls = feed.calls.load(Ordering::SeqCst);
        assert!(calls >= 4, "expected repeated attempts, got {calls}");
        assert!(sched.is_running());
        assert!(!sched.is_busy());
        let statuses = notifier.statuses.lock().unwrap().clone();
        assert_eq!(statuses.len(), calls);
        assert!(statuses.iter().all(|s| matches!(s, SyncStatus::Error(_))));

        sched.stop().await;
        assert!(!sched.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_a_loop_does_not_end_the_next_one() {
        let feed = Arc::new(StaticFeed::new(vec![offer("1", "A")]));
        let sched = SyncScheduler::new(
            feed.clone(),
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingNotifier::default()),
            SchedulerConfig {
                poll_interval: Duration::from_secs(2),
                max_items: 10,
            },
        );

        sched.stop().await;
        assert!(!sched.is_running());
        assert!(sched.start());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(sched.is_running());
        let first_run = feed.calls().len();
        assert!(first_run >= 4, "loop ended early after {first_run} cycles");

        sched.stop().await;
        sched.stop().await;
        assert!(sched.start());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sched.is_running());
        assert!(feed.calls().len() >= first_run + 2);
        sched.stop().await;
        assert!(!sched.is_running());
    }

    #[test]
    fn status_lines_render() {
        assert_eq!(SyncStatus::NewItems(1).to_string(), "1 new item");
        assert_eq!(SyncStatus::NewItems(3).to_string(), "3 new items");
        assert_eq!(SyncStatus::NoNewItems.to_string(), "no new items");
        assert_eq!(SyncStatus::Unchanged.to_string(), "catalog unchanged");
        assert_eq!(
            SyncStatus::Error("timeout".into()).to_string(),
            "sync failed: timeout"
        );
    }
}
