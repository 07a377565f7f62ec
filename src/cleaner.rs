//! # Cleaner
//!
//! Purges history every known author has already consumed.
//!
//! ## Safe Deletion Point
//!
//! ```text
//!   watermarks:   app = 40    widget = 25    intent = 31
//!                              ▲
//!                              min = 25
//!
//!   log:  … 23  24  25 │ 26  27 … 40  41
//!         ─────────────┘
//!          deletable: timestamp < 26
//! ```
//!
//! A watermark at `t` means its author has read everything at or below `t`
//! (fetches return entries strictly after the watermark). So the earliest
//! entry not yet consumed by every author is the first one after the minimum
//! watermark, and everything strictly before `min + 1` can go.
//!
//! An author without a watermark either blocks deletion entirely
//! ([`AbsentWatermarkPolicy::Block`], the default) or counts as having read
//! up to now ([`AbsentWatermarkPolicy::TreatAsNow`]).
//!
//! ## Retention Floor
//!
//! With a maximum retention set, entries older than `now - max_retention`
//! are deleted whatever the watermarks say. An author that stops reading
//! then loses that history instead of pinning the log.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{AbsentWatermarkPolicy, CleanupStrategy};
use crate::error::{Error, Result};
use crate::history::TransactionLog;
use crate::types::{Author, SafeDeletionPoint, Timestamp};
use crate::watermark::WatermarkTracker;

// =============================================================================
// Safe Deletion Point
// =============================================================================

/// Computes the safe deletion point from a set of watermarks.
///
/// Pure function: `now` is only consulted for absent watermarks under
/// [`AbsentWatermarkPolicy::TreatAsNow`].
pub fn safe_deletion_point(
    watermarks: &[(Author, Option<Timestamp>)],
    policy: AbsentWatermarkPolicy,
    now: Timestamp,
) -> SafeDeletionPoint {
    let mut min: Option<Timestamp> = None;

    for (author, watermark) in watermarks {
        let effective = match (watermark, policy) {
            (Some(ts), _) => *ts,
            (None, AbsentWatermarkPolicy::Block) => {
                return SafeDeletionPoint::Blocked(Some(author.clone()));
            }
            (None, AbsentWatermarkPolicy::TreatAsNow) => now,
        };
        min = Some(min.map_or(effective, |m| m.min(effective)));
    }

    match min {
        Some(ts) => SafeDeletionPoint::Before(ts.next()),
        None => SafeDeletionPoint::Blocked(None),
    }
}

/// The oldest instant kept under a maximum retention.
pub fn retention_floor(now: Timestamp, max_retention: Duration) -> Timestamp {
    let retention_ms = u64::try_from(max_retention.as_millis()).unwrap_or(u64::MAX);
    Timestamp::from_millis(now.as_millis().saturating_sub(retention_ms))
}

// =============================================================================
// Cleaner
// =============================================================================

/// What one cleanup run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    /// Number of transactions deleted.
    pub removed: usize,

    /// The deletion point the run used.
    pub point: SafeDeletionPoint,
}

/// Deletes history below the safe deletion point.
pub struct Cleaner {
    log: Arc<dyn TransactionLog>,
    tracker: Arc<WatermarkTracker>,
    policy: AbsentWatermarkPolicy,
    max_retention: Option<Duration>,
}

impl Cleaner {
    /// Creates a cleaner over `log`, reading watermarks from `tracker`.
    pub fn new(log: Arc<dyn TransactionLog>, tracker: Arc<WatermarkTracker>, policy: AbsentWatermarkPolicy) -> Self {
        Self {
            log,
            tracker,
            policy,
            max_retention: None,
        }
    }

    /// Deletes history older than `max_retention` even if it is unread.
    pub fn with_max_retention(mut self, max_retention: Option<Duration>) -> Self {
        self.max_retention = max_retention;
        self
    }

    /// Computes the current safe deletion point for `known_authors`.
    pub fn deletion_point(&self, known_authors: &BTreeSet<Author>) -> Result<SafeDeletionPoint> {
        let watermarks = self
            .tracker
            .watermarks(known_authors)
            .map_err(Error::into_cleanup_failed)?;
        let now = Timestamp::now();
        let point = safe_deletion_point(&watermarks, self.policy, now);

        Ok(match self.max_retention {
            Some(retention) => {
                let floor = retention_floor(now, retention);
                let raised = point.clone().with_floor(floor);
                if raised != point {
                    debug!(from = %point, to = %raised, "retention floor applied");
                }
                raised
            }
            None => point,
        })
    }

    /// Deletes every transaction consumed by all of `known_authors`.
    ///
    /// # Errors
    ///
    /// `Error::CleanupFailed` if `known_authors` is empty, the watermarks
    /// can't be read, or the delete fails. The log deletes in one
    /// transaction, so a failed run removes nothing and re-running is safe.
    pub fn clean(&self, known_authors: &BTreeSet<Author>) -> Result<CleanupStats> {
        if known_authors.is_empty() {
            return Err(Error::CleanupFailed("no known authors".to_string()));
        }

        let point = self.deletion_point(known_authors)?;
        let removed = match point.bound() {
            Some(before) => self
                .log
                .delete_before(before)
                .map_err(Error::into_cleanup_failed)?,
            None => {
                debug!(point = %point, "cleanup skipped");
                0
            }
        };

        if removed > 0 {
            info!(removed, point = %point, "history cleaned");
        }

        Ok(CleanupStats { removed, point })
    }
}

// =============================================================================
// Cleanup Schedule
// =============================================================================

/// Decides when cycle-counted cleanup is due.
///
/// Timer-based cleanup is driven by the coordinator's interval; this only
/// counts completed fetch cycles for [`CleanupStrategy::EveryNthCycle`].
#[derive(Debug, Clone)]
pub struct CleanupSchedule {
    strategy: CleanupStrategy,
    cycles: u32,
}

impl CleanupSchedule {
    /// Creates a schedule for `strategy`.
    pub fn new(strategy: CleanupStrategy) -> Self {
        Self { strategy, cycles: 0 }
    }

    /// Records a completed fetch cycle. Returns true if cleanup is due now.
    pub fn cycle_completed(&mut self) -> bool {
        match self.strategy {
            CleanupStrategy::EveryNthCycle(n) if n > 0 => {
                self.cycles += 1;
                if self.cycles >= n {
                    self.cycles = 0;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
