//! End-to-end coordinator behavior: signals, coalescing, failure handling,
//! reconfiguration, and cleanup scheduling.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use common::{create_temp_db_file, event, eventually, manual_config};
use spitetrack::sink;
use spitetrack::{
    Author, CleanupStrategy, Coordinator, CoordinatorState, Error, LogQuery, MemoryTimestampStore, SqliteLog,
    Timestamp, Transaction, TransactionLog, TransactionSink,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(10);

// =============================================================================
// Test Collaborators
// =============================================================================

/// A log whose reads fail while `broken` is set.
struct FlakyLog {
    inner: SqliteLog,
    broken: AtomicBool,
}

impl TransactionLog for FlakyLog {
    fn query(&self, since: Timestamp, authors: &BTreeSet<Author>) -> spitetrack::Result<LogQuery> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Internal("log unreachable".to_string()));
        }
        self.inner.query(since, authors)
    }

    fn delete_before(&self, before: Timestamp) -> spitetrack::Result<usize> {
        self.inner.delete_before(before)
    }
}

/// A sink that rejects batches while `broken` is set.
#[derive(Default)]
struct FlakySink {
    broken: AtomicBool,
    delivered: Mutex<Vec<u64>>,
}

impl TransactionSink for FlakySink {
    fn deliver(&self, batch: &[Transaction]) -> spitetrack::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::DeliveryFailed("consumer offline".to_string()));
        }
        self.delivered.lock().unwrap().extend(batch.iter().map(|t| t.id));
        Ok(())
    }
}

/// A sink that reports each delivery and then waits to be released.
struct GateSink {
    entered: mpsc::UnboundedSender<usize>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl TransactionSink for GateSink {
    fn deliver(&self, batch: &[Transaction]) -> spitetrack::Result<()> {
        let _ = self.entered.send(batch.len());
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_notify_delivers_other_authors_writes() {
    let (_dir, path) = create_temp_db_file("notify.db");
    let writer = SqliteLog::open(&path).unwrap();
    let reader_log = SqliteLog::open(&path).unwrap();

    let (sink, mut stream) = sink::channel();
    let handle = Coordinator::with_sqlite(manual_config("app", &["app", "widget"]), &reader_log, Arc::new(sink))
        .unwrap()
        .spawn();

    let written = writer
        .append_batch(&Author::new("widget"), (0..3).map(|i| event(i.to_string())).collect())
        .unwrap();
    writer.append(&Author::new("app"), event("own")).unwrap();
    assert!(handle.notify().unwrap());

    let batch = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    let ids: Vec<u64> = batch.iter().map(|t| t.id).collect();
    assert_eq!(ids, written.iter().map(|t| t.id).collect::<Vec<_>>());

    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.watermark, writer.head().unwrap());
    assert_eq!(handle.state(), CoordinatorState::Idle);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_initial_sync_runs_on_start() {
    let log = SqliteLog::open_in_memory().unwrap();
    log.append(&Author::new("widget"), event("w")).unwrap();

    let (sink, mut stream) = sink::channel();
    let config = manual_config("app", &["app", "widget"]).with_initial_sync(true);
    let handle = Coordinator::with_sqlite(config, &log, Arc::new(sink)).unwrap().spawn();

    let batch = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signals_during_a_cycle_coalesce_into_one_follow_up() {
    let log = SqliteLog::open_in_memory().unwrap();
    let widget = Author::new("widget");
    log.append(&widget, event("first")).unwrap();

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let gate = GateSink {
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };

    let handle = Coordinator::with_sqlite(manual_config("app", &["app", "widget"]), &log, Arc::new(gate))
        .unwrap()
        .spawn();

    assert!(handle.notify().unwrap());
    assert_eq!(entered_rx.recv().await, Some(1));
    assert_eq!(handle.state(), CoordinatorState::Fetching);

    // The cycle is parked in delivery. New writes land, signals pile up.
    log.append(&widget, event("second")).unwrap();
    assert!(handle.notify().unwrap());
    assert!(!handle.notify().unwrap());
    assert!(!handle.notify().unwrap());

    release_tx.send(()).unwrap();
    assert_eq!(entered_rx.recv().await, Some(1));
    release_tx.send(()).unwrap();

    eventually(WAIT, TICK, || (handle.metrics().cycles_completed == 2).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.metrics().cycles_completed, 2);
    assert_eq!(handle.metrics().transactions_delivered, 2);
    assert_eq!(handle.state(), CoordinatorState::Idle);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_delivery_failure_keeps_watermark_and_redelivers() {
    let log = SqliteLog::open_in_memory().unwrap();
    let written = log.append(&Author::new("widget"), event("w")).unwrap();

    let sink = Arc::new(FlakySink::default());
    sink.broken.store(true, Ordering::SeqCst);

    let coordinator =
        Coordinator::with_sqlite(manual_config("app", &["app", "widget"]), &log, sink.clone()).unwrap();
    let tracker = coordinator.tracker();
    let handle = coordinator.spawn();

    let err = handle.sync_now().await.unwrap_err();
    assert!(matches!(err, Error::DeliveryFailed(_)));
    assert!(err.is_recoverable());
    assert_eq!(tracker.get(&Author::new("app")).unwrap(), None);
    assert_eq!(handle.state(), CoordinatorState::Idle);
    assert_eq!(handle.metrics().cycles_failed, 1);

    sink.broken.store(false, Ordering::SeqCst);
    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(*sink.delivered.lock().unwrap(), vec![written.id]);
    assert_eq!(tracker.get(&Author::new("app")).unwrap(), Some(written.timestamp));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_fetch_failure_keeps_watermark() {
    let inner = SqliteLog::open_in_memory().unwrap();
    inner.append(&Author::new("widget"), event("w")).unwrap();
    let log = Arc::new(FlakyLog {
        inner,
        broken: AtomicBool::new(true),
    });
    let store = Arc::new(MemoryTimestampStore::new());

    let mut coordinator = Coordinator::new(
        manual_config("app", &["app", "widget"]),
        log.clone(),
        store,
        Arc::new(()),
    )
    .unwrap();

    let err = coordinator.run_cycle().await.unwrap_err();
    assert!(matches!(err, Error::FetchFailed(_)));
    assert_eq!(coordinator.tracker().get(&Author::new("app")).unwrap(), None);
    assert_eq!(coordinator.state(), CoordinatorState::Idle);

    log.broken.store(false, Ordering::SeqCst);
    let report = coordinator.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.advanced);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let log = SqliteLog::open_in_memory().unwrap();
    log.append(&Author::new("widget"), event("w")).unwrap();

    let handle = Coordinator::with_sqlite(manual_config("app", &["app", "widget"]), &log, Arc::new(()))
        .unwrap()
        .spawn();
    let mut states = handle.watch_state();

    handle.sync_now().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), CoordinatorState::Idle);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reconfigure_bumps_epoch_and_widens_fetch() {
    let log = SqliteLog::open_in_memory().unwrap();
    let intent = log.append(&Author::new("intent"), event("i")).unwrap();

    let (sink, mut stream) = sink::channel();
    let handle = Coordinator::with_sqlite(manual_config("app", &["app", "widget"]), &log, Arc::new(sink))
        .unwrap()
        .spawn();

    // Not yet known: skipped, but the watermark still moves past it.
    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.epoch, 1);

    let err = handle.reconfigure(["widget", "intent"]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    assert_eq!(handle.reconfigure(["app", "widget", "intent"]).await.unwrap(), 2);
    let later = log.append(&Author::new("intent"), event("i2")).unwrap();

    let report = handle.sync_now().await.unwrap();
    assert_eq!(report.epoch, 2);
    assert_eq!(report.delivered, 1);
    let batch = stream.try_recv().unwrap();
    assert_eq!(batch[0].id, later.id);
    assert_ne!(batch[0].id, intent.id);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_clean_now_and_cycle_counted_cleanup() {
    let (_dir, path) = create_temp_db_file("cleanup.db");
    let app_log = SqliteLog::open(&path).unwrap();
    let widget_log = SqliteLog::open(&path).unwrap();

    let app = Coordinator::with_sqlite(
        manual_config("app", &["app", "widget"]).with_cleanup(CleanupStrategy::EveryNthCycle(1)),
        &app_log,
        Arc::new(()),
    )
    .unwrap()
    .spawn();
    let widget = Coordinator::with_sqlite(manual_config("widget", &["app", "widget"]), &widget_log, Arc::new(()))
        .unwrap()
        .spawn();

    for i in 0..4 {
        widget_log.append(&Author::new("widget"), event(i.to_string())).unwrap();
    }

    // widget hasn't read yet: app's scheduled cleanup is blocked.
    let report = app.sync_now().await.unwrap();
    assert_eq!(report.cleanup.map(|c| c.removed), Some(0));
    assert_eq!(app_log.len().unwrap(), 4);

    widget.sync_now().await.unwrap();
    let stats = widget.clean_now().await.unwrap();
    assert_eq!(stats.removed, 4);
    assert!(app_log.is_empty().unwrap());

    assert_eq!(widget.clean_now().await.unwrap().removed, 0);

    app.shutdown().await;
    widget.shutdown().await;
}

#[tokio::test]
async fn test_poll_interval_triggers_cycles() {
    let log = SqliteLog::open_in_memory().unwrap();
    let (sink, mut stream) = sink::channel();
    let config = manual_config("app", &["app", "widget"]).with_poll_interval(Duration::from_millis(20));
    let handle = Coordinator::with_sqlite(config, &log, Arc::new(sink)).unwrap().spawn();

    log.append(&Author::new("widget"), event("w")).unwrap();

    // No notify: the poll timer alone picks the write up.
    let batch = tokio::time::timeout(WAIT, stream.recv()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_handle_after_shutdown() {
    let log = SqliteLog::open_in_memory().unwrap();
    let handle = Coordinator::with_sqlite(manual_config("app", &["app"]), &log, Arc::new(()))
        .unwrap()
        .spawn();
    let other = handle.clone();

    handle.shutdown().await;
    other.shutdown().await;

    assert!(matches!(other.notify(), Err(Error::Shutdown)));
    assert!(matches!(other.sync_now().await, Err(Error::Shutdown)));
}
