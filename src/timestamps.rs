//! Durable author → last-consumed-timestamp storage.
//!
//! [`TimestampStore`] is the key-value interface the watermark tracker
//! persists through. Two implementations ship with the crate:
//!
//! - [`SqliteTimestampStore`]: the `watermarks` table of the shared history
//!   database, visible to every process using the store
//! - [`MemoryTimestampStore`]: a process-local map, for embedding and tests

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};

use crate::error::{Error, Result};
use crate::schema::{self, SharedConnection};
use crate::types::{current_time_ms, Author, Timestamp};

/// Persistence for per-author watermarks.
pub trait TimestampStore: Send + Sync {
    /// Loads an author's last consumed timestamp. `None` if the author has
    /// never saved one.
    fn load(&self, author: &Author) -> Result<Option<Timestamp>>;

    /// Saves an author's last consumed timestamp.
    fn save(&self, author: &Author, timestamp: Timestamp) -> Result<()>;

    /// Loads the watermarks of several authors at once.
    fn load_many(&self, authors: &BTreeSet<Author>) -> Result<Vec<(Author, Option<Timestamp>)>> {
        authors
            .iter()
            .map(|author| Ok((author.clone(), self.load(author)?)))
            .collect()
    }
}

// =============================================================================
// SQLite Store
// =============================================================================

/// Watermarks kept in the shared history database.
///
/// `save` never lowers a stored value: the upsert keeps
/// `MAX(stored, new)`, so two processes racing for the same author can't
/// move its watermark backward.
#[derive(Clone)]
pub struct SqliteTimestampStore {
    conn: SharedConnection,
}

impl SqliteTimestampStore {
    /// Uses the given connection, typically [`SqliteLog::connection`].
    ///
    /// [`SqliteLog::connection`]: crate::SqliteLog::connection
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

impl TimestampStore for SqliteTimestampStore {
    fn load(&self, author: &Author) -> Result<Option<Timestamp>> {
        let conn = schema::lock(&self.conn)?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT timestamp_ms FROM watermarks WHERE author = ?",
                [author.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        value.map(Timestamp::from_sql).transpose()
    }

    fn save(&self, author: &Author, timestamp: Timestamp) -> Result<()> {
        let conn = schema::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO watermarks (author, timestamp_ms, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(author) DO UPDATE SET
                 timestamp_ms = MAX(watermarks.timestamp_ms, excluded.timestamp_ms),
                 updated_ms = excluded.updated_ms",
            params![author.as_str(), timestamp.to_sql()?, current_time_ms() as i64],
        )?;
        Ok(())
    }

    fn load_many(&self, authors: &BTreeSet<Author>) -> Result<Vec<(Author, Option<Timestamp>)>> {
        // One lock for the whole set, so cleanup sees a consistent view.
        let conn = schema::lock(&self.conn)?;
        let mut stmt = conn.prepare_cached("SELECT timestamp_ms FROM watermarks WHERE author = ?")?;

        let mut out = Vec::with_capacity(authors.len());
        for author in authors {
            let value: Option<i64> = stmt
                .query_row([author.as_str()], |row| row.get(0))
                .optional()?;
            out.push((author.clone(), value.map(Timestamp::from_sql).transpose()?));
        }
        Ok(out)
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Watermarks kept in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryTimestampStore {
    values: Mutex<HashMap<Author, Timestamp>>,
}

impl MemoryTimestampStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Author, Timestamp>>> {
        self.values
            .lock()
            .map_err(|_| Error::Internal("timestamp store mutex poisoned".to_string()))
    }
}

impl TimestampStore for MemoryTimestampStore {
    fn load(&self, author: &Author) -> Result<Option<Timestamp>> {
        Ok(self.values()?.get(author).copied())
    }

    fn save(&self, author: &Author, timestamp: Timestamp) -> Result<()> {
        self.values()?
            .entry(author.clone())
            .and_modify(|stored| *stored = (*stored).max(timestamp))
            .or_insert(timestamp);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
