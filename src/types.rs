//! # Domain Types for SpiteTrack
//!
//! This module defines the core types of the history tracking domain:
//! authors, timestamps, transactions, changes, and watermarks.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Authors and timestamps wrap primitive types in single-field structs, so a
//! watermark can't be confused with a row id and an author can't be confused
//! with an entity name.
//!
//! ## Invariants
//!
//! - [`Timestamp`]: strictly increasing across the log, never zero for a
//!   stored transaction ([`Timestamp::ZERO`] means "before everything")
//! - [`Transaction`]: immutable once written, changes kept in write order
//! - [`Watermark`]: never moves backward for an author

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// =============================================================================
// Authors
// =============================================================================

/// A named consumer/writer sharing the history log.
///
/// Every process, extension, or sync agent that writes to the shared store
/// tags its transactions with its author name, and tracks its own reading
/// progress under the same name.
///
/// # Example
///
/// ```rust
/// use spitetrack::types::Author;
///
/// let app = Author::new("app");
/// assert_eq!(app.as_str(), "app");
/// assert_eq!(app, Author::from("app"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Author(String);

impl Author {
    /// Creates a new author from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the author name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Author {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Author {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Author> for Author {
    fn from(a: &Author) -> Self {
        a.clone()
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// An instant in the history log, in Unix milliseconds.
///
/// # Ordering
///
/// The log assigns each transaction a timestamp strictly greater than the
/// previous one, so timestamps double as log positions. When the wall clock
/// stalls or goes backward the log uses `head + 1` instead.
///
/// # Rust Pattern: Copy
///
/// `Timestamp` is 8 bytes and passed around constantly, so it is `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The instant before every transaction. Fetching from here returns the
    /// whole log.
    pub const ZERO: Timestamp = Timestamp(0);

    /// The largest timestamp the log can store. SQLite integers are signed
    /// 64-bit.
    pub const MAX: Timestamp = Timestamp(i64::MAX as u64);

    /// Creates a timestamp from Unix milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Returns the raw milliseconds value for storage.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(current_time_ms())
    }

    /// The next representable instant.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Converts to a SQLite integer.
    ///
    /// # Errors
    ///
    /// `Error::TimestampOutOfRange` if the value is above [`Timestamp::MAX`].
    pub fn to_sql(&self) -> Result<i64> {
        i64::try_from(self.0).map_err(|_| Error::TimestampOutOfRange(self.0))
    }

    /// Reads a stored SQLite integer back.
    pub(crate) fn from_sql(value: i64) -> Result<Self> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| Error::Schema(format!("negative timestamp {value} in database")))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the current time as Unix milliseconds.
///
/// A clock before the Unix epoch reads as zero rather than panicking.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Changes
// =============================================================================

/// The kind of row-level mutation a [`Change`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A row was created.
    Insert,
    /// An existing row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl ChangeKind {
    /// Integer code stored in the `changes.kind` column.
    pub fn as_raw(&self) -> i64 {
        match self {
            ChangeKind::Insert => 0,
            ChangeKind::Update => 1,
            ChangeKind::Delete => 2,
        }
    }

    /// Decodes a stored kind code. Unknown codes return `None`.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(ChangeKind::Insert),
            1 => Some(ChangeKind::Update),
            2 => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

/// A single row-level mutation belonging to a [`Transaction`].
///
/// `entity` and `row_key` identify the row so a consumer can apply or merge
/// the change into its own view. `payload` is opaque to SpiteTrack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// What happened to the row.
    pub kind: ChangeKind,

    /// The entity (table/type) the row belongs to.
    pub entity: String,

    /// Identity of the row within its entity.
    pub row_key: String,

    /// Application data carried with the change (empty for deletes).
    pub payload: Vec<u8>,
}

impl Change {
    /// Creates a change of the given kind.
    pub fn new(
        kind: ChangeKind,
        entity: impl Into<String>,
        row_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            row_key: row_key.into(),
            payload,
        }
    }

    /// Shorthand for an insert.
    pub fn insert(entity: impl Into<String>, row_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(ChangeKind::Insert, entity, row_key, payload)
    }

    /// Shorthand for an update.
    pub fn update(entity: impl Into<String>, row_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(ChangeKind::Update, entity, row_key, payload)
    }

    /// Shorthand for a delete.
    pub fn delete(entity: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self::new(ChangeKind::Delete, entity, row_key, Vec::new())
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// An atomic, ordered group of changes written by one author at one instant.
///
/// Transactions are owned by the history log. Readers only ever get copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Log insertion order. Breaks timestamp ties and identifies the
    /// transaction within one log.
    pub id: u64,

    /// The author that wrote this transaction.
    pub author: Author,

    /// Position of this transaction in the log.
    pub timestamp: Timestamp,

    /// Row-level changes, in write order.
    pub changes: Vec<Change>,
}

// =============================================================================
// Watermarks
// =============================================================================

/// How far an author has consumed the log.
///
/// A watermark at `t` means every transaction with `timestamp <= t` has been
/// seen by this author, because fetches return entries strictly after the
/// watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    /// The consuming author.
    pub author: Author,

    /// The last consumed instant.
    pub timestamp: Timestamp,
}

/// The point below which log entries have been read by every known author.
///
/// Never stored; recomputed from the current watermarks on every cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeDeletionPoint {
    /// Nothing may be deleted. Carries the author whose missing watermark
    /// blocks cleanup, or `None` when there were no authors to consider.
    Blocked(Option<Author>),

    /// Entries strictly older than this timestamp may be deleted.
    Before(Timestamp),
}

impl SafeDeletionPoint {
    /// Returns the deletion bound, if deletion is allowed at all.
    pub fn bound(&self) -> Option<Timestamp> {
        match self {
            SafeDeletionPoint::Blocked(_) => None,
            SafeDeletionPoint::Before(ts) => Some(*ts),
        }
    }

    /// Raises the point to at least `floor`, overriding a block.
    pub fn with_floor(self, floor: Timestamp) -> Self {
        match self {
            SafeDeletionPoint::Before(ts) if ts >= floor => self,
            _ => SafeDeletionPoint::Before(floor),
        }
    }
}

impl fmt::Display for SafeDeletionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeDeletionPoint::Blocked(Some(author)) => {
                write!(f, "blocked by '{author}' (no watermark)")
            }
            SafeDeletionPoint::Blocked(None) => write!(f, "blocked (no authors)"),
            SafeDeletionPoint::Before(ts) => write!(f, "before {ts}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
