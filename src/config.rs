//! # Tracker Configuration
//!
//! [`TrackerConfig`] describes one author's view of a shared history log: who
//! it is, which authors share the log, how deletion is scheduled, and what to
//! do about authors that have never read anything.
//!
//! ## Epochs
//!
//! The author set is fixed per configuration. Changing it produces a new
//! configuration with a higher `epoch`. An author added in a later epoch only
//! sees history that was still in the log when it joined; its missing
//! watermark blocks cleanup (under the default policy) until it has read once,
//! so adding an author never makes anything deletable early.
//!
//! ## Who Counts for Cleanup
//!
//! ```text
//!   fetched from:   all_authors ∪ batch_authors
//!   cleanup waits:  all_authors − batch_authors − mirroring author
//! ```
//!
//! Batch authors (bulk importers, background writers) and the mirroring agent
//! only write. They never record a watermark, so waiting for them would pin
//! history forever. `max_retention` bounds how long any author that never
//! reads can hold history back.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Author;

// =============================================================================
// Defaults
// =============================================================================

/// Default cleanup interval (5 minutes).
///
/// Cleanup scans every author's watermark and deletes in one write
/// transaction, so it runs on its own slower schedule.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Author name used by an external mirroring/sync agent.
pub const DEFAULT_MIRRORING_AUTHOR: &str = "mirroring.import";

// =============================================================================
// Strategies and Policies
// =============================================================================

/// When the coordinator purges consumed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// Never clean automatically. Cleanup only runs through `clean_now`.
    Disabled,

    /// Clean after every `n` completed fetch cycles.
    EveryNthCycle(u32),

    /// Clean on a timer, independent of fetch cadence.
    Interval(Duration),
}

impl CleanupStrategy {
    /// The timer period, for interval-based cleanup.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            CleanupStrategy::Interval(d) => Some(*d),
            _ => None,
        }
    }
}

impl Default for CleanupStrategy {
    fn default() -> Self {
        CleanupStrategy::Interval(DEFAULT_CLEANUP_INTERVAL)
    }
}

/// How cleanup treats a known author that has no watermark yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsentWatermarkPolicy {
    /// Treat the missing watermark as negative infinity: nothing is deleted
    /// until every known author has read at least once.
    #[default]
    Block,

    /// Treat the missing watermark as "now": that author's unread backlog
    /// may be deleted.
    TreatAsNow,
}

// =============================================================================
// Tracker Configuration
// =============================================================================

/// Configuration for one author's coordinator.
///
/// # Example
///
/// ```rust
/// use spitetrack::TrackerConfig;
///
/// let config = TrackerConfig::new("app", ["app", "widget"])
///     .with_mirroring_author(true)
///     .with_exclude_self_writes(true);
/// config.validate()?;
/// # Ok::<(), spitetrack::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The author this coordinator reads and advances for.
    pub current_author: Author,

    /// Every author that reads from or writes to the shared log.
    pub all_authors: BTreeSet<Author>,

    /// Write-only authors: fetched, but never waited on by cleanup.
    pub batch_authors: BTreeSet<Author>,

    /// Whether the mirroring agent's writes are visible to this reader.
    pub include_mirroring_author: bool,

    /// Name the mirroring agent writes under.
    pub mirroring_author: Author,

    /// Whether this author's own transactions are left out of fetch results.
    pub exclude_self_writes: bool,

    /// Cleanup schedule.
    pub cleanup: CleanupStrategy,

    /// Policy for authors without a watermark.
    pub absent_watermark_policy: AbsentWatermarkPolicy,

    /// If set, history older than this is deleted even if some author
    /// hasn't read it.
    pub max_retention: Option<Duration>,

    /// If set, run a fetch cycle on this period even without signals.
    pub poll_interval: Option<Duration>,

    /// Run one fetch cycle as soon as the coordinator starts.
    pub initial_sync: bool,

    /// Configuration generation. Bumped whenever `all_authors` changes.
    pub epoch: u64,
}

impl TrackerConfig {
    /// Creates a configuration with default options.
    pub fn new<I, A>(current_author: impl Into<Author>, all_authors: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Author>,
    {
        Self {
            current_author: current_author.into(),
            all_authors: all_authors.into_iter().map(Into::into).collect(),
            batch_authors: BTreeSet::new(),
            include_mirroring_author: false,
            mirroring_author: Author::new(DEFAULT_MIRRORING_AUTHOR),
            exclude_self_writes: true,
            cleanup: CleanupStrategy::default(),
            absent_watermark_policy: AbsentWatermarkPolicy::default(),
            max_retention: None,
            poll_interval: None,
            initial_sync: true,
            epoch: 1,
        }
    }

    /// Declares write-only authors.
    pub fn with_batch_authors<I, A>(mut self, batch_authors: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Author>,
    {
        self.batch_authors = batch_authors.into_iter().map(Into::into).collect();
        self
    }

    /// Caps how long unread history is kept.
    pub fn with_max_retention(mut self, max_retention: Duration) -> Self {
        self.max_retention = Some(max_retention);
        self
    }

    /// Makes the mirroring agent's writes visible (or hidden).
    pub fn with_mirroring_author(mut self, include: bool) -> Self {
        self.include_mirroring_author = include;
        self
    }

    /// Changes the name of the mirroring agent.
    pub fn with_mirroring_author_name(mut self, name: impl Into<Author>) -> Self {
        self.mirroring_author = name.into();
        self
    }

    /// Sets whether own writes are excluded from fetch results.
    pub fn with_exclude_self_writes(mut self, exclude: bool) -> Self {
        self.exclude_self_writes = exclude;
        self
    }

    /// Cleans on a timer with the given period.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup = CleanupStrategy::Interval(interval);
        self
    }

    /// Sets the cleanup strategy.
    pub fn with_cleanup(mut self, cleanup: CleanupStrategy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Sets the absent-watermark policy.
    pub fn with_absent_watermark_policy(mut self, policy: AbsentWatermarkPolicy) -> Self {
        self.absent_watermark_policy = policy;
        self
    }

    /// Polls the log on a fixed period in addition to explicit signals.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets whether a cycle runs immediately on start.
    pub fn with_initial_sync(mut self, initial_sync: bool) -> Self {
        self.initial_sync = initial_sync;
        self
    }

    /// Returns a copy with a new author set and the next epoch.
    pub fn with_all_authors<I, A>(&self, all_authors: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Author>,
    {
        let mut next = self.clone();
        next.all_authors = all_authors.into_iter().map(Into::into).collect();
        next.epoch = self.epoch + 1;
        next
    }

    /// Authors whose writes this author fetches.
    pub fn fetch_authors(&self) -> BTreeSet<Author> {
        self.all_authors.union(&self.batch_authors).cloned().collect()
    }

    /// Authors whose watermarks bound cleanup.
    ///
    /// Always contains the current author, which reads even if it is also
    /// named as the mirroring agent.
    pub fn cleanup_authors(&self) -> BTreeSet<Author> {
        self.all_authors
            .iter()
            .filter(|a| {
                **a == self.current_author || (!self.batch_authors.contains(*a) && **a != self.mirroring_author)
            })
            .cloned()
            .collect()
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` if the author set is empty, doesn't contain the
    /// current author, the current author is declared write-only, or a
    /// cleanup/poll/retention period is zero.
    pub fn validate(&self) -> Result<()> {
        if self.all_authors.is_empty() {
            return Err(Error::InvalidConfig("all_authors must not be empty".to_string()));
        }
        if !self.all_authors.contains(&self.current_author) {
            return Err(Error::InvalidConfig(format!(
                "all_authors must include the current author '{}'",
                self.current_author
            )));
        }
        if self.batch_authors.contains(&self.current_author) {
            return Err(Error::InvalidConfig(format!(
                "current author '{}' reads and can't be a batch author",
                self.current_author
            )));
        }
        match self.cleanup {
            CleanupStrategy::EveryNthCycle(0) => {
                return Err(Error::InvalidConfig(
                    "cleanup cycle count must be at least 1".to_string(),
                ));
            }
            CleanupStrategy::Interval(d) if d.is_zero() => {
                return Err(Error::InvalidConfig("cleanup interval must be non-zero".to_string()));
            }
            _ => {}
        }
        if matches!(self.poll_interval, Some(d) if d.is_zero()) {
            return Err(Error::InvalidConfig("poll interval must be non-zero".to_string()));
        }
        if matches!(self.max_retention, Some(d) if d.is_zero()) {
            return Err(Error::InvalidConfig("max retention must be non-zero".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
