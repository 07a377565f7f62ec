#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spitetrack::{
    Author, Change, Cleaner, Fetcher, SqliteLog, SqliteTimestampStore, TrackerConfig, WatermarkTracker,
};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = SqliteLog::open(&path).expect("initialize database");
    (dir, path)
}

pub fn authors(names: &[&str]) -> BTreeSet<Author> {
    names.iter().map(|n| Author::new(*n)).collect()
}

pub fn event(key: impl Into<String>) -> Vec<Change> {
    vec![Change::insert("Event", key, Vec::new())]
}

/// Config with automatic cleanup and the initial cycle turned off, so tests
/// decide exactly when things run.
pub fn manual_config(author: &str, all: &[&str]) -> TrackerConfig {
    TrackerConfig::new(author, all.iter().copied())
        .with_cleanup(spitetrack::CleanupStrategy::Disabled)
        .with_initial_sync(false)
}

/// One author's view of a database file through its own connection, the
/// way a separate process would see it.
pub struct Participant {
    pub author: Author,
    pub log: SqliteLog,
    pub tracker: Arc<WatermarkTracker>,
    pub fetcher: Fetcher,
    pub cleaner: Cleaner,
}

impl Participant {
    pub fn open(path: &std::path::Path, author: &str) -> Self {
        let log = SqliteLog::open(path).expect("open log");
        Self::over(log, author)
    }

    pub fn over(log: SqliteLog, author: &str) -> Self {
        let tracker = Arc::new(WatermarkTracker::new(Arc::new(SqliteTimestampStore::new(
            log.connection(),
        ))));
        let fetcher = Fetcher::new(
            Arc::new(log.clone()),
            Author::new(author),
            Author::new(spitetrack::config::DEFAULT_MIRRORING_AUTHOR),
        );
        let cleaner = Cleaner::new(
            Arc::new(log.clone()),
            Arc::clone(&tracker),
            spitetrack::AbsentWatermarkPolicy::Block,
        );
        Self {
            author: Author::new(author),
            log,
            tracker,
            fetcher,
            cleaner,
        }
    }

    /// Fetches everything other authors wrote since this author's watermark,
    /// then advances the watermark. Returns the delivered transaction ids.
    pub fn consume(&self, all: &BTreeSet<Author>) -> Vec<u64> {
        let since = self
            .tracker
            .get(&self.author)
            .expect("load watermark")
            .unwrap_or(spitetrack::Timestamp::ZERO);
        let batch = self.fetcher.fetch(since, all, true, false).expect("fetch");
        let ids = batch.transactions.iter().map(|t| t.id).collect();
        if let Some(target) = batch.advance_target() {
            self.tracker.advance(&self.author, target).expect("advance");
        }
        ids
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
