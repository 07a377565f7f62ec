//! # Transaction History Log
//!
//! The history log is the shared, append-only, author-tagged sequence of
//! transactions that every consumer reads from. SpiteTrack talks to it
//! through the [`TransactionLog`] trait and ships [`SqliteLog`], a
//! SQLite-backed implementation that several processes can share through one
//! database file.
//!
//! ## Ordering
//!
//! ```text
//!   writer "app"     writer "widget"      log (timestamp order)
//!        │                 │
//!        ├── T(100) ───────┼──────────►  100  app
//!        │                 ├── T(101) ►  101  widget
//!        ├── T(101→102) ───┼──────────►  102  app     (clock tie: head + 1)
//! ```
//!
//! Timestamps are assigned inside a `BEGIN IMMEDIATE` transaction as
//! `max(now, head + 1)`, so they strictly increase even when writers in
//! different processes race or the wall clock steps backward.
//!
//! ## Snapshot Reads
//!
//! [`TransactionLog::query`] returns the matching transactions together with
//! the log head, both read in the same SQLite read transaction. Every
//! transaction with `timestamp <= head` is visible in that snapshot, which
//! lets a reader advance its watermark to the head even when nothing
//! matched.

use std::collections::BTreeSet;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::schema::{self, Database, SharedConnection};
use crate::types::{current_time_ms, Author, Change, ChangeKind, Timestamp, Transaction};

// =============================================================================
// Log Interface
// =============================================================================

/// The result of one snapshot read of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    /// Matching transactions, ascending by timestamp.
    pub transactions: Vec<Transaction>,

    /// Newest timestamp ever assigned, as of the same snapshot.
    /// `None` if nothing has ever been written.
    pub head: Option<Timestamp>,
}

/// An ordered, append-only, author-tagged transaction log.
///
/// Implementations must be transactionally consistent with concurrent
/// writers: a query observes either all or none of a transaction, and a
/// delete never removes entries a concurrent query already returned as
/// `>= before`.
pub trait TransactionLog: Send + Sync {
    /// Returns every transaction with `timestamp > since` written by one of
    /// `authors`, ascending by timestamp.
    fn query(&self, since: Timestamp, authors: &BTreeSet<Author>) -> Result<LogQuery>;

    /// Deletes every transaction with `timestamp < before`. Returns the
    /// number removed.
    fn delete_before(&self, before: Timestamp) -> Result<usize>;
}

// =============================================================================
// SQLite Log
// =============================================================================

/// A [`TransactionLog`] stored in a SQLite database file.
///
/// # Example
///
/// ```rust
/// use std::collections::BTreeSet;
/// use spitetrack::{Author, Change, SqliteLog, Timestamp, TransactionLog};
///
/// let log = SqliteLog::open_in_memory()?;
/// log.append(&Author::new("app"), vec![Change::insert("Event", "1", vec![])])?;
///
/// let authors: BTreeSet<Author> = [Author::new("app")].into_iter().collect();
/// let snapshot = log.query(Timestamp::ZERO, &authors)?;
/// assert_eq!(snapshot.transactions.len(), 1);
/// # Ok::<(), spitetrack::Error>(())
/// ```
#[derive(Clone)]
pub struct SqliteLog {
    conn: SharedConnection,
}

impl SqliteLog {
    /// Wraps an already-initialized shared connection.
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Opens (and initializes) a history database file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?.into_shared()))
    }

    /// Creates a log backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?.into_shared()))
    }

    /// Returns the shared connection, so a timestamp store can live in the
    /// same database.
    pub fn connection(&self) -> SharedConnection {
        SharedConnection::clone(&self.conn)
    }

    /// Appends one transaction stamped with the current time.
    pub fn append(&self, author: &Author, changes: Vec<Change>) -> Result<Transaction> {
        let mut written = self.append_batch(author, vec![changes])?;
        written
            .pop()
            .ok_or_else(|| Error::Internal("append produced no transaction".to_string()))
    }

    /// Appends several transactions by one author in a single SQLite
    /// transaction. They get consecutive, strictly increasing timestamps.
    pub fn append_batch(&self, author: &Author, batch: Vec<Vec<Change>>) -> Result<Vec<Transaction>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = schema::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut head = read_head(&tx)?.unwrap_or(Timestamp::ZERO);
        let now = Timestamp::now();
        let mut written = Vec::with_capacity(batch.len());

        for changes in batch {
            let timestamp = now.max(head.next());
            written.push(insert_transaction(&tx, author, timestamp, changes)?);
            head = timestamp;
        }

        write_head(&tx, head)?;
        tx.commit()?;

        Ok(written)
    }

    /// Appends one transaction at an explicit timestamp.
    ///
    /// # Errors
    ///
    /// - `Error::TimestampOutOfRange` if `timestamp` is above [`Timestamp::MAX`]
    /// - `Error::NonMonotonicTimestamp` if `timestamp` is not after the head
    pub fn append_at(&self, author: &Author, timestamp: Timestamp, changes: Vec<Change>) -> Result<Transaction> {
        timestamp.to_sql()?;

        let mut conn = schema::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(head) = read_head(&tx)? {
            if timestamp <= head {
                return Err(Error::NonMonotonicTimestamp {
                    head: head.as_millis(),
                    requested: timestamp.as_millis(),
                });
            }
        }

        let written = insert_transaction(&tx, author, timestamp, changes)?;
        write_head(&tx, timestamp)?;
        tx.commit()?;

        Ok(written)
    }

    /// Newest timestamp ever assigned, even if since deleted.
    pub fn head(&self) -> Result<Option<Timestamp>> {
        let conn = schema::lock(&self.conn)?;
        read_head(&conn)
    }

    /// Number of transactions currently stored.
    pub fn len(&self) -> Result<usize> {
        let conn = schema::lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns true if no transactions are stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl TransactionLog for SqliteLog {
    fn query(&self, since: Timestamp, authors: &BTreeSet<Author>) -> Result<LogQuery> {
        if authors.is_empty() {
            return Err(Error::FetchFailed("author set is empty".to_string()));
        }

        let mut conn = schema::lock(&self.conn)?;

        // Deferred transaction: the snapshot starts at the first read and is
        // shared by the head lookup and every following SELECT.
        let tx = conn.transaction()?;
        let head = read_head(&tx)?;

        let placeholders = vec!["?"; authors.len()].join(", ");
        let sql = format!(
            "SELECT tx_id, author, timestamp_ms FROM transactions
             WHERE timestamp_ms > ? AND author IN ({placeholders})
             ORDER BY timestamp_ms, tx_id"
        );

        let mut bind: Vec<Value> = Vec::with_capacity(authors.len() + 1);
        // Nothing is stored above MAX, so clamping keeps the comparison exact.
        bind.push(Value::Integer(since.min(Timestamp::MAX).to_sql()?));
        bind.extend(authors.iter().map(|a| Value::Text(a.as_str().to_string())));

        let headers: Vec<(i64, String, i64)> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut transactions = Vec::with_capacity(headers.len());
        for (tx_id, author, timestamp_ms) in headers {
            transactions.push(Transaction {
                id: tx_id as u64,
                author: Author::new(author),
                timestamp: Timestamp::from_sql(timestamp_ms)?,
                changes: load_changes(&tx, tx_id)?,
            });
        }

        tx.commit()?;

        Ok(LogQuery { transactions, head })
    }

    fn delete_before(&self, before: Timestamp) -> Result<usize> {
        let mut conn = schema::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // A bound past MAX covers every storable row.
        let (op, bound) = match before.to_sql() {
            Ok(bound) => ("<", bound),
            Err(_) => ("<=", i64::MAX),
        };
        tx.execute(
            &format!("DELETE FROM changes WHERE tx_id IN (SELECT tx_id FROM transactions WHERE timestamp_ms {op} ?)"),
            [bound],
        )?;
        let removed = tx.execute(&format!("DELETE FROM transactions WHERE timestamp_ms {op} ?"), [bound])?;

        tx.commit()?;
        Ok(removed)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Inserts a transaction and its changes. Caller owns the SQL transaction.
fn insert_transaction(
    conn: &Connection,
    author: &Author,
    timestamp: Timestamp,
    changes: Vec<Change>,
) -> Result<Transaction> {
    conn.execute(
        "INSERT INTO transactions (author, timestamp_ms, created_ms) VALUES (?, ?, ?)",
        params![author.as_str(), timestamp.to_sql()?, current_time_ms() as i64],
    )?;
    let tx_id = conn.last_insert_rowid();

    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO changes (tx_id, seq, kind, entity, row_key, payload) VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        for (seq, change) in changes.iter().enumerate() {
            stmt.execute(params![
                tx_id,
                seq as i64,
                change.kind.as_raw(),
                change.entity,
                change.row_key,
                change.payload,
            ])?;
        }
    }

    Ok(Transaction {
        id: tx_id as u64,
        author: author.clone(),
        timestamp,
        changes,
    })
}

fn load_changes(conn: &Connection, tx_id: i64) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare_cached(
        "SELECT kind, entity, row_key, payload FROM changes WHERE tx_id = ? ORDER BY seq",
    )?;
    let rows = stmt.query_map([tx_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
        ))
    })?;

    let mut changes = Vec::new();
    for row in rows {
        let (kind, entity, row_key, payload) = row?;
        let kind = ChangeKind::from_raw(kind).ok_or_else(|| {
            Error::Schema(format!("unknown change kind {kind} in transaction {tx_id}"))
        })?;
        changes.push(Change { kind, entity, row_key, payload });
    }
    Ok(changes)
}

fn read_head(conn: &Connection) -> Result<Option<Timestamp>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM spitetrack_metadata WHERE key = 'log_head'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|v| {
            v.parse::<u64>()
                .map(Timestamp::from_millis)
                .map_err(|_| Error::Schema(format!("corrupted log head '{v}'")))
        })
        .transpose()
}

fn write_head(conn: &Connection, head: Timestamp) -> Result<()> {
    conn.execute(
        "INSERT INTO spitetrack_metadata (key, value) VALUES ('log_head', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [head.as_millis().to_string()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn authors(names: &[&str]) -> BTreeSet<Author> {
        names.iter().map(|n| Author::new(*n)).collect()
    }

    #[test]
    fn test_append_assigns_increasing_timestamps() {
        let log = SqliteLog::open_in_memory().unwrap();
        let app = Author::new("app");

        let written = log
            .append_batch(&app, (0..5).map(|i| vec![Change::insert("Event", i.to_string(), vec![])]).collect())
            .unwrap();

        assert_eq!(written.len(), 5);
        for pair in written.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        assert_eq!(log.head().unwrap(), Some(written[4].timestamp));
    }

    #[test]
    fn test_append_at_rejects_non_increasing() {
        let log = SqliteLog::open_in_memory().unwrap();
        let app = Author::new("app");

        log.append_at(&app, Timestamp::from_millis(10), vec![]).unwrap();
        let err = log.append_at(&app, Timestamp::from_millis(10), vec![]).unwrap_err();
        assert!(matches!(err, Error::NonMonotonicTimestamp { head: 10, requested: 10 }));
    }

    #[test]
    fn test_query_filters_by_author_and_since() {
        let log = SqliteLog::open_in_memory().unwrap();
        log.append_at(&Author::new("a"), Timestamp::from_millis(1), vec![]).unwrap();
        log.append_at(&Author::new("b"), Timestamp::from_millis(2), vec![]).unwrap();
        log.append_at(&Author::new("c"), Timestamp::from_millis(3), vec![]).unwrap();

        let snapshot = log.query(Timestamp::from_millis(1), &authors(&["a", "b"])).unwrap();
        let stamps: Vec<u64> = snapshot.transactions.iter().map(|t| t.timestamp.as_millis()).collect();
        assert_eq!(stamps, vec![2]);
        assert_eq!(snapshot.head, Some(Timestamp::from_millis(3)));
    }

    #[test]
    fn test_query_returns_changes_in_order() {
        let log = SqliteLog::open_in_memory().unwrap();
        let app = Author::new("app");
        let changes = vec![
            Change::insert("Event", "1", b"one".to_vec()),
            Change::update("Event", "1", b"uno".to_vec()),
            Change::delete("Event", "1"),
        ];
        log.append(&app, changes.clone()).unwrap();

        let snapshot = log.query(Timestamp::ZERO, &authors(&["app"])).unwrap();
        assert_eq!(snapshot.transactions[0].changes, changes);
    }

    #[test]
    fn test_query_rejects_empty_author_set() {
        let log = SqliteLog::open_in_memory().unwrap();
        let err = log.query(Timestamp::ZERO, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)));
    }

    #[test]
    fn test_delete_before_is_exclusive_and_keeps_head() {
        let log = SqliteLog::open_in_memory().unwrap();
        for ts in 1..=4 {
            log.append_at(&Author::new("a"), Timestamp::from_millis(ts), vec![Change::delete("E", "k")])
                .unwrap();
        }

        assert_eq!(log.delete_before(Timestamp::from_millis(3)).unwrap(), 2);
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.delete_before(Timestamp::from_millis(3)).unwrap(), 0);

        assert_eq!(log.delete_before(Timestamp::from_millis(100)).unwrap(), 2);
        assert!(log.is_empty().unwrap());

        // Head survives deletion, so the next write still lands after it.
        assert_eq!(log.head().unwrap(), Some(Timestamp::from_millis(4)));
        let err = log.append_at(&Author::new("a"), Timestamp::from_millis(2), vec![]).unwrap_err();
        assert!(matches!(err, Error::NonMonotonicTimestamp { .. }));
    }

    #[test]
    fn test_unstorable_timestamps_are_rejected() {
        let log = SqliteLog::open_in_memory().unwrap();
        let widget = Author::new("widget");

        let err = log
            .append_at(&widget, Timestamp::from_millis(1 << 63), event_changes())
            .unwrap_err();
        assert!(matches!(err, Error::TimestampOutOfRange(ts) if ts == 1 << 63));
        assert_eq!(log.head().unwrap(), None);
        assert!(log.is_empty().unwrap());

        // The last storable instant is fine, but nothing can follow it.
        let last = log.append_at(&widget, Timestamp::MAX, event_changes()).unwrap();
        let err = log.append(&widget, event_changes()).unwrap_err();
        assert!(matches!(err, Error::TimestampOutOfRange(_)));
        assert_eq!(log.head().unwrap(), Some(Timestamp::MAX));

        let snapshot = log.query(Timestamp::ZERO, &authors(&["widget"])).unwrap();
        let ids: Vec<u64> = snapshot.transactions.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![last.id]);
        assert_eq!(snapshot.transactions[0].timestamp, Timestamp::MAX);
    }

    #[test]
    fn test_bounds_past_max_are_clamped() {
        let log = SqliteLog::open_in_memory().unwrap();
        log.append_at(&Author::new("a"), Timestamp::MAX, vec![]).unwrap();

        let beyond = Timestamp::from_millis(u64::MAX);
        assert!(log.query(beyond, &authors(&["a"])).unwrap().transactions.is_empty());
        assert_eq!(log.delete_before(beyond).unwrap(), 1);
        assert!(log.is_empty().unwrap());
    }

    fn event_changes() -> Vec<Change> {
        vec![Change::insert("Event", "1", vec![])]
    }

    #[test]
    fn test_delete_removes_changes_too() {
        let log = SqliteLog::open_in_memory().unwrap();
        log.append(&Author::new("a"), vec![Change::insert("E", "1", vec![1])]).unwrap();
        log.delete_before(Timestamp::from_millis(u64::MAX >> 1)).unwrap();

        let conn = schema::lock(&log.conn).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
