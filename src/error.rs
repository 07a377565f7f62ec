//! # Error Handling for SpiteTrack
//!
//! This module defines the error types used throughout SpiteTrack. A single
//! error enum ([`Error`]) represents every failure mode, so callers match on
//! one type whether the failure came from the history log, the watermark
//! store, or the coordinator runtime.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From<rusqlite::Error>` comes from the `#[from]` attribute
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Cycle failure | `FetchFailed`, `WatermarkPersistFailed`, `CleanupFailed`, `DeliveryFailed` | Retry on next signal |
//! | Collaborator | `Sqlite`, `NonMonotonicTimestamp`, `TimestampOutOfRange` | Surfaced by the log or store |
//! | Setup | `InvalidConfig`, `Schema` | Fix configuration or database |
//! | Runtime | `Shutdown`, `Internal` | Coordinator is gone |
//!
//! Cycle failures never leave partially persisted state behind. The
//! coordinator logs them, returns to idle, and the next trigger retries from
//! the last persisted watermark.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteTrack operations.
///
/// # Example
///
/// ```rust
/// use spitetrack::Error;
///
/// let err = Error::FetchFailed("history log is locked".to_string());
/// assert!(err.is_recoverable());
/// assert_eq!(err.to_string(), "fetch failed: history log is locked");
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cycle Failures (recoverable, retried on the next trigger)
    // =========================================================================

    /// Reading the history log failed, or the query was malformed.
    ///
    /// # When This Happens
    ///
    /// - The log database is unreachable or locked past the busy timeout
    /// - The caller asked for transactions of an empty author set
    /// - The reader's own watermark could not be loaded
    ///
    /// # Recovery
    ///
    /// Nothing was delivered and no watermark moved. The next signal retries
    /// from the same checkpoint.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Persisting an advanced watermark failed.
    ///
    /// The batch that triggered the advance may already have been delivered,
    /// so it will be delivered again on the next cycle (at-least-once).
    #[error("failed to persist watermark for author '{author}': {reason}")]
    WatermarkPersistFailed {
        /// The author whose watermark could not be saved
        author: String,
        /// The underlying store failure
        reason: String,
    },

    /// Computing the safe deletion point or deleting history failed.
    ///
    /// Deletion runs in one log transaction, so entries removed by an earlier
    /// successful run stay removed and re-running is always safe.
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),

    /// A downstream sink refused a batch of transactions.
    ///
    /// The watermark is not advanced, so the batch is offered again.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// which lets `?` convert rusqlite errors automatically inside the log and
    /// store implementations. Component boundaries then map this variant into
    /// one of the cycle failures above.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An explicit timestamp would break the strictly increasing log order.
    #[error("timestamp {requested} is not after the log head {head}")]
    NonMonotonicTimestamp {
        /// The newest timestamp already in the log
        head: u64,
        /// The timestamp the caller asked for
        requested: u64,
    },

    /// A timestamp doesn't fit SQLite's signed 64-bit integers.
    ///
    /// Rejected before anything is written, so the log never holds a value
    /// that later queries can't compare correctly.
    #[error("timestamp {0} is beyond the largest storable timestamp")]
    TimestampOutOfRange(u64),

    // =========================================================================
    // Setup Errors (not recoverable by retrying)
    // =========================================================================

    /// The tracker configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================

    /// The coordinator task has stopped and no longer accepts requests.
    #[error("coordinator has shut down")]
    Shutdown,

    /// A blocking task panicked or a lock was poisoned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if retrying the same operation later can succeed.
    ///
    /// Configuration and schema problems need an operator; everything else is
    /// treated as a transient collaborator failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidConfig(_) | Error::Schema(_) | Error::TimestampOutOfRange(_)
        )
    }

    /// Maps a collaborator error into [`Error::FetchFailed`].
    pub(crate) fn into_fetch_failed(self) -> Error {
        match self {
            Error::FetchFailed(_) => self,
            other => Error::FetchFailed(other.to_string()),
        }
    }

    /// Maps a collaborator error into [`Error::CleanupFailed`].
    pub(crate) fn into_cleanup_failed(self) -> Error {
        match self {
            Error::CleanupFailed(_) => self,
            other => Error::CleanupFailed(other.to_string()),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
