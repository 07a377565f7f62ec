//! # Fetcher
//!
//! Reads the transactions a given author has not consumed yet.
//!
//! ## Visibility Rules
//!
//! ```text
//!   query set   = forAuthors ∪ {mirroring, if included} ∪ {self}
//!   visible set = forAuthors ∪ {mirroring, if included} − {mirroring, if not}
//!   delivered   = query results ∩ visible set − {self, if excluded}
//! ```
//!
//! Self is always queried so that the caller's own writes still count toward
//! how far it may advance its watermark, even when they are not delivered.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::history::TransactionLog;
use crate::types::{Author, Timestamp, Transaction};

/// The outcome of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchBatch {
    /// Transactions to hand downstream, ascending by timestamp.
    pub transactions: Vec<Transaction>,

    /// Timestamp of the last queried transaction, delivered or not.
    pub last_seen: Option<Timestamp>,

    /// Log head in the same snapshot as the query.
    pub head: Option<Timestamp>,
}

impl FetchBatch {
    /// How far the reader may move its watermark after consuming this batch.
    ///
    /// The head qualifies because the snapshot already contains every
    /// transaction at or below it.
    pub fn advance_target(&self) -> Option<Timestamp> {
        self.last_seen.max(self.head)
    }

    /// Returns true if nothing is to be delivered.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Queries the history log on behalf of one author.
pub struct Fetcher {
    log: Arc<dyn TransactionLog>,
    current_author: Author,
    mirroring_author: Author,
}

impl Fetcher {
    /// Creates a fetcher for `current_author`.
    pub fn new(log: Arc<dyn TransactionLog>, current_author: Author, mirroring_author: Author) -> Self {
        Self {
            log,
            current_author,
            mirroring_author,
        }
    }

    /// The authors whose writes are visible for the given options.
    pub fn visible_authors(&self, for_authors: &BTreeSet<Author>, include_mirroring_author: bool) -> BTreeSet<Author> {
        let mut visible = for_authors.clone();
        if include_mirroring_author {
            visible.insert(self.mirroring_author.clone());
        } else {
            visible.remove(&self.mirroring_author);
        }
        visible
    }

    /// Returns every transaction after `since` written by a visible author.
    ///
    /// # Errors
    ///
    /// `Error::FetchFailed` if `for_authors` is empty or the log read fails.
    /// Zero matches is an empty batch, not an error.
    pub fn fetch(
        &self,
        since: Timestamp,
        for_authors: &BTreeSet<Author>,
        exclude_self_writes: bool,
        include_mirroring_author: bool,
    ) -> Result<FetchBatch> {
        if for_authors.is_empty() {
            return Err(Error::FetchFailed("author set is empty".to_string()));
        }

        let visible = self.visible_authors(for_authors, include_mirroring_author);
        let mut query_set = visible.clone();
        query_set.insert(self.current_author.clone());

        let snapshot = self
            .log
            .query(since, &query_set)
            .map_err(Error::into_fetch_failed)?;

        debug_assert!(
            snapshot.transactions.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
            "log returned transactions out of order"
        );

        let last_seen = snapshot.transactions.last().map(|t| t.timestamp);
        let transactions = snapshot
            .transactions
            .into_iter()
            .filter(|t| visible.contains(&t.author))
            .filter(|t| !(exclude_self_writes && t.author == self.current_author))
            .collect();

        Ok(FetchBatch {
            transactions,
            last_seen,
            head: snapshot.head,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
