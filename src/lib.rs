//! # SpiteTrack - Multi-Consumer Change History Tracking
//!
//! SpiteTrack keeps a shared, append-only log of data-change transactions
//! that several independent consumers (an app, its widgets, an intents
//! extension, a sync agent) write to and read from. It provides:
//!
//! - **Per-author watermarks**: each consumer remembers how far it has read
//! - **Filtered fetches**: read only what other authors wrote since then
//! - **Safe cleanup**: delete history only once every known author consumed it
//! - **Signal coalescing**: bursts of change notifications cost one extra scan
//!
//! ## Architecture Overview
//!
//! ```text
//!   app process                widget process               (any writer)
//! ┌──────────────────┐       ┌──────────────────┐
//! │   Coordinator    │       │   Coordinator    │   notify()   ─────────┐
//! │  Idle → Fetching │       │  Idle → Fetching │ ◄────────────────────┘
//! │  → Advancing     │       │  → Advancing     │
//! │  → Cleaning      │       │  → Cleaning      │
//! └──┬─────┬─────┬───┘       └──┬─────┬─────┬───┘
//!    │     │     │              │     │     │
//!    ▼     ▼     ▼              ▼     ▼     ▼
//! Fetcher Watermark Cleaner  Fetcher Watermark Cleaner
//!    │     Tracker   │          │     Tracker   │
//!    └──────┬────────┘          └──────┬────────┘
//!           ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 shared SQLite file (WAL mode)                   │
//! │     transactions + changes        │        watermarks           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Monotonic watermarks**: an author's watermark never moves backward
//! 2. **No loss**: every transaction by another known author with a
//!    timestamp above a reader's watermark is delivered before the watermark
//!    passes it
//! 3. **Safe cleanup**: nothing an author hasn't consumed is ever deleted
//! 4. **Ordered delivery**: fetch results ascend by timestamp
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum for every failure mode
//! - [`types`]: Domain types (Author, Timestamp, Transaction, ...)
//! - [`config`]: Tracker configuration and cleanup strategies
//! - [`schema`]: SQLite DDL and database initialization
//! - [`history`]: The transaction log trait and its SQLite implementation
//! - [`timestamps`]: Watermark persistence
//! - [`watermark`]: Monotonic watermark tracking
//! - [`fetcher`]: Watermark-relative, author-filtered reads
//! - [`cleaner`]: Safe deletion point and history purging
//! - [`sink`]: Downstream delivery
//! - [`coordinator`]: The async state machine tying it together

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SpiteTrack operations.
pub mod error;

/// Domain types.
///
/// Newtypes for authors and timestamps keep them from being mixed up with
/// plain strings and integers.
pub mod types;

/// Tracker configuration.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// The shared transaction history log.
///
/// See [`history::TransactionLog`] for the contract and
/// [`history::SqliteLog`] for the shipped implementation.
pub mod history;

/// Per-author watermark persistence.
pub mod timestamps;

/// Monotonic watermark tracking.
pub mod watermark;

/// Fetching unconsumed transactions for one author.
pub mod fetcher;

/// Safe deletion point computation and history cleanup.
pub mod cleaner;

/// Delivery of fetched transactions to the consumer.
pub mod sink;

/// The per-author coordinator.
///
/// The main entry point is [`Coordinator`](coordinator::Coordinator), which
/// runs as a tokio task and is driven through a
/// [`CoordinatorHandle`](coordinator::CoordinatorHandle).
pub mod coordinator;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use schema::{Database, SharedConnection};

pub use types::{Author, Change, ChangeKind, SafeDeletionPoint, Timestamp, Transaction, Watermark};

pub use config::{AbsentWatermarkPolicy, CleanupStrategy, TrackerConfig};

pub use history::{LogQuery, SqliteLog, TransactionLog};
pub use timestamps::{MemoryTimestampStore, SqliteTimestampStore, TimestampStore};
pub use watermark::WatermarkTracker;

pub use cleaner::{retention_floor, safe_deletion_point, Cleaner, CleanupStats};
pub use fetcher::{FetchBatch, Fetcher};
pub use sink::{ChannelSink, TransactionSink, TransactionStream};

pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorMetrics, CoordinatorState, CycleReport};
