//! Watermark monotonicity, within a process and across connections.

mod common;

use std::sync::Arc;
use std::thread;

use common::create_temp_db_file;
use proptest::prelude::*;
use spitetrack::{Author, MemoryTimestampStore, SqliteLog, SqliteTimestampStore, Timestamp, WatermarkTracker};

#[test]
fn test_watermark_survives_reopen() {
    let (_dir, path) = create_temp_db_file("reopen.db");
    let app = Author::new("app");

    {
        let log = SqliteLog::open(&path).unwrap();
        let tracker = WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(log.connection())));
        tracker.advance(&app, Timestamp::from_millis(42)).unwrap();
    }

    let log = SqliteLog::open(&path).unwrap();
    let tracker = WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(log.connection())));
    assert_eq!(tracker.get(&app).unwrap(), Some(Timestamp::from_millis(42)));
}

#[test]
fn test_concurrent_advances_in_one_process() {
    let tracker = Arc::new(WatermarkTracker::new(Arc::new(MemoryTimestampStore::new())));
    let app = Author::new("app");

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let tracker = Arc::clone(&tracker);
            let app = app.clone();
            thread::spawn(move || {
                // Each thread walks its own interleaved values, some descending.
                for i in (0..50u64).rev() {
                    tracker.advance(&app, Timestamp::from_millis(i * 8 + t)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tracker.get(&app).unwrap(), Some(Timestamp::from_millis(49 * 8 + 7)));
}

#[test]
fn test_concurrent_advances_across_connections_never_regress() {
    let (_dir, path) = create_temp_db_file("racing.db");
    let app = Author::new("app");

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let path = path.clone();
            let app = app.clone();
            thread::spawn(move || {
                let log = SqliteLog::open(&path).unwrap();
                let tracker = WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(log.connection())));
                for i in 0..25u64 {
                    tracker.advance(&app, Timestamp::from_millis(i * 4 + t)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let log = SqliteLog::open(&path).unwrap();
    let tracker = WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(log.connection())));
    assert_eq!(tracker.get(&app).unwrap(), Some(Timestamp::from_millis(24 * 4 + 3)));
}

proptest! {
    #[test]
    fn prop_watermark_is_running_maximum(values in proptest::collection::vec(0u64..1_000, 1..40)) {
        let log = SqliteLog::open_in_memory().unwrap();
        let tracker = WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(log.connection())));
        let app = Author::new("app");

        let mut max: Option<Timestamp> = None;
        for v in values {
            let ts = Timestamp::from_millis(v);
            let moved = tracker.advance(&app, ts).unwrap();
            prop_assert_eq!(moved, max.map_or(true, |m| ts > m));
            max = Some(max.map_or(ts, |m| m.max(ts)));
            prop_assert_eq!(tracker.get(&app).unwrap(), max);
        }
    }
}
