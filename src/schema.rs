//! # SQLite Schema for SpiteTrack
//!
//! This module defines the history database schema and handles
//! initialization. One database file is shared by every author (process,
//! extension, sync agent) that writes to or reads from the store.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  transactions               changes                 watermarks          │
//! │  ┌────────────────┐         ┌────────────────┐      ┌────────────────┐  │
//! │  │ tx_id (PK)     │◄────────│ tx_id          │      │ author (PK)    │  │
//! │  │ author         │         │ seq            │      │ timestamp_ms   │  │
//! │  │ timestamp_ms   │         │ kind           │      │ updated_ms     │  │
//! │  │ created_ms     │         │ entity, row_key│      └────────────────┘  │
//! │  └────────────────┘         │ payload BLOB   │                          │
//! │                             └────────────────┘                          │
//! │                                                                         │
//! │  spitetrack_metadata: schema_version, log_head                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why keep `log_head` in metadata?
//!
//! Cleanup deletes old transactions, and can delete all of them. The newest
//! timestamp ever assigned must survive that, otherwise a writer could hand
//! out a timestamp below a reader's watermark and the reader would never see
//! it. The head is updated in the same write transaction as the insert.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per transaction in the shared history log.
///
/// # Columns
///
/// - `tx_id`: insertion order, breaks timestamp ties
/// - `author`: writer name
/// - `timestamp_ms`: log position, strictly increasing, unique
/// - `created_ms`: wall clock at insert, for diagnostics
const CREATE_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    tx_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    author       TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL UNIQUE,
    created_ms   INTEGER NOT NULL
)
"#;

/// Supports `WHERE author IN (...) AND timestamp_ms > ?`.
const CREATE_TRANSACTIONS_AUTHOR_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS transactions_author_ts
ON transactions(author, timestamp_ms)
"#;

/// Row-level changes, `seq` preserves write order within a transaction.
const CREATE_CHANGES: &str = r#"
CREATE TABLE IF NOT EXISTS changes (
    tx_id   INTEGER NOT NULL REFERENCES transactions(tx_id),
    seq     INTEGER NOT NULL,
    kind    INTEGER NOT NULL,
    entity  TEXT NOT NULL,
    row_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    PRIMARY KEY (tx_id, seq)
)
"#;

/// Last consumed timestamp per author.
const CREATE_WATERMARKS: &str = r#"
CREATE TABLE IF NOT EXISTS watermarks (
    author       TEXT PRIMARY KEY,
    timestamp_ms INTEGER NOT NULL,
    updated_ms   INTEGER NOT NULL
)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitetrack_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Shared Connection
// =============================================================================

/// A connection shared by the log and the timestamp store of one process.
///
/// # Why a Mutex?
///
/// `rusqlite::Connection` is `Send` but not `Sync`. Wrapping it in a
/// `Mutex` lets the coordinator's blocking tasks use it from any thread,
/// one statement sequence at a time. Other processes open their own
/// connection to the same file; SQLite's file locking serializes them.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Locks a shared connection, turning poisoning into an error.
pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::Internal("sqlite connection mutex poisoned".to_string()))
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the SpiteTrack schema installed.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use spitetrack::Database;
    ///
    /// let db = Database::open("history.db")?;
    /// # Ok::<(), spitetrack::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to their connection, so the log and
    /// the timestamp store must share it through [`Database::into_shared`].
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates tables, sets pragmas, and verifies the schema version.
    fn initialize(&mut self) -> Result<()> {
        // Set first: other processes may hold the file while we initialize.
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL: readers keep a consistent snapshot while another process writes.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_TRANSACTIONS)?;
        self.conn.execute_batch(CREATE_TRANSACTIONS_AUTHOR_INDEX)?;
        self.conn.execute_batch(CREATE_CHANGES)?;
        self.conn.execute_batch(CREATE_WATERMARKS)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM spitetrack_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO spitetrack_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this SpiteTrack version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns a connection that the log and the
    /// timestamp store can share.
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self.conn))
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
