//! # Watermark Tracker
//!
//! Holds and advances each author's last-consumed timestamp on top of a
//! [`TimestampStore`].
//!
//! ## Monotonicity
//!
//! `advance` only ever moves a watermark forward. A request to move it to an
//! earlier or equal instant is a no-op, not an error. Read-compare-write runs
//! under a lock so two advances racing inside one process can't interleave;
//! the SQLite store additionally keeps `MAX(old, new)` on upsert for
//! processes racing on the same file.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::timestamps::TimestampStore;
use crate::types::{Author, Timestamp, Watermark};

/// Per-author consumption progress.
pub struct WatermarkTracker {
    store: Arc<dyn TimestampStore>,

    /// Serializes read-compare-write in `advance`.
    advance_lock: Mutex<()>,
}

impl WatermarkTracker {
    /// Creates a tracker persisting through `store`.
    pub fn new(store: Arc<dyn TimestampStore>) -> Self {
        Self {
            store,
            advance_lock: Mutex::new(()),
        }
    }

    /// Returns the author's watermark, or `None` if it has never consumed
    /// anything. `None` is distinct from [`Timestamp::ZERO`].
    pub fn get(&self, author: &Author) -> Result<Option<Timestamp>> {
        self.store.load(author)
    }

    /// Moves the author's watermark forward to `to`.
    ///
    /// Returns `true` if the stored value changed, `false` if `to` was not
    /// after the current watermark.
    ///
    /// # Errors
    ///
    /// `Error::WatermarkPersistFailed` if the store can't be read or written.
    /// The stored value is unchanged in that case.
    pub fn advance(&self, author: &Author, to: Timestamp) -> Result<bool> {
        let _guard = self
            .advance_lock
            .lock()
            .map_err(|_| Error::Internal("watermark lock poisoned".to_string()))?;

        let persist_failed = |e: Error| Error::WatermarkPersistFailed {
            author: author.to_string(),
            reason: e.to_string(),
        };

        let current = self.store.load(author).map_err(persist_failed)?;
        if matches!(current, Some(existing) if to <= existing) {
            return Ok(false);
        }

        self.store.save(author, to).map_err(persist_failed)?;
        debug!(author = %author, from = ?current.map(|t| t.as_millis()), to = to.as_millis(), "watermark advanced");
        Ok(true)
    }

    /// Returns the recorded watermarks of `authors`. Authors that have never
    /// consumed anything are listed with `None`.
    pub fn watermarks(&self, authors: &BTreeSet<Author>) -> Result<Vec<(Author, Option<Timestamp>)>> {
        self.store.load_many(authors)
    }

    /// Returns the recorded watermark of each author that has one.
    pub fn recorded(&self, authors: &BTreeSet<Author>) -> Result<Vec<Watermark>> {
        Ok(self
            .watermarks(authors)?
            .into_iter()
            .filter_map(|(author, ts)| ts.map(|timestamp| Watermark { author, timestamp }))
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
