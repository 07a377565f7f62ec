//! # Coordinator
//!
//! The coordinator drives one author's consumption of a shared history log:
//! it reacts to change signals, fetches what the author hasn't seen,
//! delivers it downstream, advances the author's watermark, and purges
//! history on its own schedule.
//!
//! ## State Machine
//!
//! ```text
//!            signal / poll / sync_now
//!   ┌──────┐ ───────────────────────► ┌──────────┐  ok   ┌───────────┐
//!   │ Idle │                          │ Fetching │ ────► │ Advancing │
//!   └──────┘ ◄─────────────────────── └──────────┘       └─────┬─────┘
//!      ▲  ▲         FetchFailed /          │                   │
//!      │  │         DeliveryFailed         │                   │ cleanup due?
//!      │  └────────────────────────────────┘                   ▼
//!      │                                                 ┌──────────┐
//!      └──────────────────────────────────────────────── │ Cleaning │
//!                     timer / clean_now ───────────────► └──────────┘
//! ```
//!
//! ## Actor Model
//!
//! The coordinator runs as a single tokio task that owns all of its state,
//! so cycles for one store never overlap. Callers talk to it through a
//! cloneable [`CoordinatorHandle`]:
//!
//! ```text
//!   notify() ──► signal channel (capacity 1) ──┐
//!                                              ├──► coordinator task ──► spawn_blocking
//!   sync_now() / clean_now() ──► requests ─────┘         (serial)         (SQLite I/O)
//! ```
//!
//! ## Coalescing
//!
//! The signal channel holds a single slot. While a cycle is running, the
//! first `notify()` fills the slot and every later one finds it full and is
//! dropped. When the cycle ends the task takes the slot and runs exactly one
//! follow-up. Bursts of writes cost at most two scans.
//!
//! ## Failure Handling
//!
//! Nothing is persisted until the fetched batch has been delivered. A fetch
//! or delivery failure returns to `Idle` with the watermark untouched, so the
//! next trigger retries from the same point. A failed watermark write after
//! a successful delivery means the batch is delivered again (at-least-once).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cleaner::{Cleaner, CleanupSchedule, CleanupStats};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::history::{SqliteLog, TransactionLog};
use crate::sink::TransactionSink;
use crate::timestamps::{SqliteTimestampStore, TimestampStore};
use crate::types::{Author, Timestamp};
use crate::watermark::WatermarkTracker;

// =============================================================================
// Configuration
// =============================================================================

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 64;

// =============================================================================
// State and Reports
// =============================================================================

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Waiting for a signal, timer, or request.
    Idle,
    /// Reading the history log.
    Fetching,
    /// Persisting the new watermark.
    Advancing,
    /// Purging consumed history.
    Cleaning,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Fetching => "fetching",
            CoordinatorState::Advancing => "advancing",
            CoordinatorState::Cleaning => "cleaning",
        };
        write!(f, "{name}")
    }
}

/// The outcome of one successful fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Configuration epoch the cycle ran under.
    pub epoch: u64,

    /// Number of transactions handed to the sink.
    pub delivered: usize,

    /// The author's watermark after the cycle.
    pub watermark: Option<Timestamp>,

    /// Whether the watermark moved.
    pub advanced: bool,

    /// Cleanup run at the end of the cycle, if one was due and succeeded.
    pub cleanup: Option<CleanupStats>,
}

/// Counters kept by a running coordinator.
#[derive(Debug, Default)]
struct Counters {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    transactions_delivered: AtomicU64,
    cleanups_completed: AtomicU64,
    cleanups_failed: AtomicU64,
    transactions_removed: AtomicU64,
}

/// A point-in-time copy of the coordinator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorMetrics {
    /// Fetch cycles that delivered and advanced successfully.
    pub cycles_completed: u64,
    /// Fetch cycles that ended in an error.
    pub cycles_failed: u64,
    /// Transactions handed to the sink, including redeliveries.
    pub transactions_delivered: u64,
    /// Cleanup runs that succeeded (whether or not they removed anything).
    pub cleanups_completed: u64,
    /// Cleanup runs that ended in an error.
    pub cleanups_failed: u64,
    /// Transactions deleted from the log by this coordinator.
    pub transactions_removed: u64,
}

impl Counters {
    fn snapshot(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            transactions_delivered: self.transactions_delivered.load(Ordering::Relaxed),
            cleanups_completed: self.cleanups_completed.load(Ordering::Relaxed),
            cleanups_failed: self.cleanups_failed.load(Ordering::Relaxed),
            transactions_removed: self.transactions_removed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

enum Request {
    Sync {
        response: oneshot::Sender<Result<CycleReport>>,
    },
    Clean {
        response: oneshot::Sender<Result<CleanupStats>>,
    },
    Reconfigure {
        all_authors: BTreeSet<Author>,
        response: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

// =============================================================================
// Coordinator
// =============================================================================

/// One author's fetch/advance/clean engine over a shared history log.
///
/// Use [`Coordinator::spawn`] to run it as a background task, or drive it
/// directly with [`Coordinator::run_cycle`] and [`Coordinator::run_cleanup`].
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use spitetrack::{Coordinator, SqliteLog, TrackerConfig};
///
/// let log = SqliteLog::open("history.db")?;
/// let (sink, mut stream) = spitetrack::sink::channel();
/// let config = TrackerConfig::new("app", ["app", "widget"]);
///
/// let handle = Coordinator::with_sqlite(config, &log, Arc::new(sink))?.spawn();
/// handle.notify()?;
/// let batch = stream.recv().await;
/// ```
pub struct Coordinator {
    config: TrackerConfig,
    fetcher: Arc<Fetcher>,
    tracker: Arc<WatermarkTracker>,
    cleaner: Arc<Cleaner>,
    sink: Arc<dyn TransactionSink>,
    schedule: CleanupSchedule,
    state_tx: watch::Sender<CoordinatorState>,
    counters: Arc<Counters>,
}

impl Coordinator {
    /// Builds a coordinator from its collaborators.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` if the configuration fails validation.
    pub fn new(
        config: TrackerConfig,
        log: Arc<dyn TransactionLog>,
        store: Arc<dyn TimestampStore>,
        sink: Arc<dyn TransactionSink>,
    ) -> Result<Self> {
        config.validate()?;

        let tracker = Arc::new(WatermarkTracker::new(store));
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&log),
            config.current_author.clone(),
            config.mirroring_author.clone(),
        ));
        let cleaner = Arc::new(
            Cleaner::new(log, Arc::clone(&tracker), config.absent_watermark_policy)
                .with_max_retention(config.max_retention),
        );
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);

        Ok(Self {
            schedule: CleanupSchedule::new(config.cleanup),
            config,
            fetcher,
            tracker,
            cleaner,
            sink,
            state_tx,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Builds a coordinator over a SQLite log, keeping watermarks in the
    /// same database.
    pub fn with_sqlite(config: TrackerConfig, log: &SqliteLog, sink: Arc<dyn TransactionSink>) -> Result<Self> {
        let store = SqliteTimestampStore::new(log.connection());
        Self::new(config, Arc::new(log.clone()), Arc::new(store), sink)
    }

    /// The active configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    /// The watermark tracker this coordinator advances.
    pub fn tracker(&self) -> Arc<WatermarkTracker> {
        Arc::clone(&self.tracker)
    }

    /// Replaces the author set, starting a new configuration epoch.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` if the new set is empty or lacks the current
    /// author. The old configuration stays in effect.
    pub fn reconfigure(&mut self, all_authors: BTreeSet<Author>) -> Result<u64> {
        let next = self.config.with_all_authors(all_authors);
        next.validate()?;

        let added: Vec<String> = next
            .all_authors
            .difference(&self.config.all_authors)
            .map(|a| a.to_string())
            .collect();
        info!(epoch = next.epoch, authors = next.all_authors.len(), added = ?added, "author set changed");

        self.config = next;
        Ok(self.config.epoch)
    }

    /// Runs one fetch → deliver → advance cycle, then cleanup if the
    /// cycle-counted schedule says it is due.
    ///
    /// Always ends in [`CoordinatorState::Idle`].
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        debug!(author = %self.config.current_author, epoch = self.config.epoch, "fetch cycle started");

        let result = match self.fetch_deliver_advance().await {
            Ok(mut report) => {
                self.counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
                if self.schedule.cycle_completed() {
                    report.cleanup = self.run_cleanup().await.ok();
                }
                debug!(
                    author = %self.config.current_author,
                    delivered = report.delivered,
                    advanced = report.advanced,
                    "fetch cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.counters.cycles_failed.fetch_add(1, Ordering::Relaxed);
                warn!(author = %self.config.current_author, error = %e, "fetch cycle failed");
                Err(e)
            }
        };

        self.set_state(CoordinatorState::Idle);
        result
    }

    async fn fetch_deliver_advance(&mut self) -> Result<CycleReport> {
        let author = self.config.current_author.clone();

        // Fetching
        self.set_state(CoordinatorState::Fetching);
        let (previous, batch) = {
            let fetcher = Arc::clone(&self.fetcher);
            let tracker = Arc::clone(&self.tracker);
            let author = author.clone();
            let authors = self.config.fetch_authors();
            let exclude_self = self.config.exclude_self_writes;
            let include_mirroring = self.config.include_mirroring_author;

            run_blocking(move || {
                let previous = tracker.get(&author).map_err(Error::into_fetch_failed)?;
                let since = previous.unwrap_or(Timestamp::ZERO);
                let batch = fetcher.fetch(since, &authors, exclude_self, include_mirroring)?;
                Ok((previous, batch))
            })
            .await?
        };

        let delivered = batch.transactions.len();
        // An empty log still records a watermark, so this author stops
        // blocking cleanup once it has looked at least once.
        let target = batch.advance_target().unwrap_or(Timestamp::ZERO);

        if delivered > 0 {
            let sink = Arc::clone(&self.sink);
            let transactions = batch.transactions;
            run_blocking(move || sink.deliver(&transactions)).await?;
            self.counters
                .transactions_delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }

        // Advancing
        self.set_state(CoordinatorState::Advancing);
        let advanced = {
            let tracker = Arc::clone(&self.tracker);
            run_blocking(move || tracker.advance(&author, target)).await?
        };

        Ok(CycleReport {
            epoch: self.config.epoch,
            delivered,
            watermark: previous.max(Some(target)),
            advanced,
            cleanup: None,
        })
    }

    /// Purges history consumed by every known author.
    ///
    /// Always ends in [`CoordinatorState::Idle`].
    pub async fn run_cleanup(&mut self) -> Result<CleanupStats> {
        self.set_state(CoordinatorState::Cleaning);

        let cleaner = Arc::clone(&self.cleaner);
        let authors = self.config.cleanup_authors();
        let result = run_blocking(move || cleaner.clean(&authors))
            .await
            .map_err(Error::into_cleanup_failed);

        match &result {
            Ok(stats) => {
                self.counters.cleanups_completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .transactions_removed
                    .fetch_add(stats.removed as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.cleanups_failed.fetch_add(1, Ordering::Relaxed);
                warn!(author = %self.config.current_author, error = %e, "cleanup failed");
            }
        }

        self.set_state(CoordinatorState::Idle);
        result
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state_tx.send_replace(state);
    }

    /// Starts the coordinator as a background tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> CoordinatorHandle {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let state_rx = self.state_tx.subscribe();
        let counters = Arc::clone(&self.counters);

        if self.config.initial_sync {
            let _ = signal_tx.try_send(());
        }

        info!(
            author = %self.config.current_author,
            authors = self.config.all_authors.len(),
            epoch = self.config.epoch,
            "coordinator started"
        );

        let task = tokio::spawn(self.run(signal_rx, request_rx));

        CoordinatorHandle {
            signal_tx,
            request_tx,
            state_rx,
            counters,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// The coordinator task's main loop.
    async fn run(mut self, mut signal_rx: mpsc::Receiver<()>, mut request_rx: mpsc::Receiver<Request>) {
        let mut cleanup_timer = self.config.cleanup.interval().map(periodic);
        let mut poll_timer = self.config.poll_interval.map(periodic);

        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Some(Request::Sync { response }) => {
                        let _ = response.send(self.run_cycle().await);
                    }
                    Some(Request::Clean { response }) => {
                        let _ = response.send(self.run_cleanup().await);
                    }
                    Some(Request::Reconfigure { all_authors, response }) => {
                        let _ = response.send(self.reconfigure(all_authors));
                    }
                    Some(Request::Shutdown) | None => break,
                },
                Some(()) = signal_rx.recv() => {
                    let _ = self.run_cycle().await;
                }
                _ = tick(&mut poll_timer) => {
                    let _ = self.run_cycle().await;
                }
                _ = tick(&mut cleanup_timer) => {
                    let _ = self.run_cleanup().await;
                }
            }
        }

        debug!(author = %self.config.current_author, "coordinator stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    signal_tx: mpsc::Sender<()>,
    request_tx: mpsc::Sender<Request>,
    state_rx: watch::Receiver<CoordinatorState>,
    counters: Arc<Counters>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    /// Signals that the log changed.
    ///
    /// Returns `true` if a cycle was queued, `false` if one was already
    /// pending and this signal was coalesced into it.
    ///
    /// # Errors
    ///
    /// `Error::Shutdown` if the coordinator has stopped.
    pub fn notify(&self) -> Result<bool> {
        match self.signal_tx.try_send(()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(())) => Ok(false),
            Err(TrySendError::Closed(())) => Err(Error::Shutdown),
        }
    }

    /// Runs a fetch cycle after any queued work and returns its report.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        self.request(|response| Request::Sync { response }).await?
    }

    /// Runs cleanup now, independent of the configured schedule.
    pub async fn clean_now(&self) -> Result<CleanupStats> {
        self.request(|response| Request::Clean { response }).await?
    }

    /// Replaces the author set. Returns the new configuration epoch.
    pub async fn reconfigure<I, A>(&self, all_authors: I) -> Result<u64>
    where
        I: IntoIterator<Item = A>,
        A: Into<Author>,
    {
        let all_authors = all_authors.into_iter().map(Into::into).collect();
        self.request(|response| Request::Reconfigure { all_authors, response })
            .await?
    }

    /// The coordinator's current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes state transitions.
    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Returns a snapshot of the coordinator's counters.
    pub fn metrics(&self) -> CoordinatorMetrics {
        self.counters.snapshot()
    }

    /// Stops the coordinator after it finishes queued requests, and waits
    /// for the task to exit.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        response_rx.await.map_err(|_| Error::Shutdown)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Runs collaborator I/O on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

/// An interval whose first tick is one full period away.
fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Waits for the next tick, or forever if there is no timer.
async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
