//! Reading history
//!
//! Decoded samples can be kept for charting. A store accepts inserts and
//! answers time-window queries in ascending time order.
//!
//! - [`MemoryHistory`]: in-process store, always available
//! - [`database::SqliteHistory`]: SQLite-backed store (requires `database` feature)
//! - [`recorder::HistoryRecorder`]: task feeding a store from manager events

#[cfg(feature = "database")]
pub mod database;
pub mod recorder;

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use phsense_core::types::{unix_millis, Sample};

#[cfg(feature = "database")]
pub use database::SqliteHistory;
pub use recorder::HistoryRecorder;

/// Length of the "custom" preset.
pub const CUSTOM_WINDOW_DAYS: u64 = 4;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in a history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// SQLite error
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store lock poisoned or held elsewhere
    #[error("History store is locked")]
    Locked,

    /// Timestamp does not fit the storage column
    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(u64),
}

/// Result type for history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

// ============================================================================
// Time Windows
// ============================================================================

/// Inclusive range of Unix-millisecond timestamps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    /// First millisecond in the window
    pub start_ms: u64,
    /// Last millisecond in the window
    pub end_ms: u64,
}

impl TimeWindow {
    /// Window between two timestamps, swapped if given in reverse.
    #[must_use]
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self {
            start_ms: start_ms.min(end_ms),
            end_ms: start_ms.max(end_ms),
        }
    }

    /// The `span` leading up to `now`.
    #[must_use]
    pub fn ending_at(now: SystemTime, span: Duration) -> Self {
        let end_ms = unix_millis(now);
        let span_ms = u64::try_from(span.as_millis()).unwrap_or(u64::MAX);
        Self::new(end_ms.saturating_sub(span_ms), end_ms)
    }

    /// The `span` leading up to the current time.
    #[must_use]
    pub fn last(span: Duration) -> Self {
        Self::ending_at(SystemTime::now(), span)
    }

    /// The last 24 hours.
    #[must_use]
    pub fn day() -> Self {
        Self::last(Duration::from_millis(MILLIS_PER_DAY))
    }

    /// The last 7 days.
    #[must_use]
    pub fn week() -> Self {
        Self::last(Duration::from_millis(7 * MILLIS_PER_DAY))
    }

    /// The last [`CUSTOM_WINDOW_DAYS`] days.
    #[must_use]
    pub fn custom() -> Self {
        Self::last(Duration::from_millis(CUSTOM_WINDOW_DAYS * MILLIS_PER_DAY))
    }

    /// Whether `timestamp_ms` falls inside the window.
    #[must_use]
    pub fn contains(&self, timestamp_ms: u64) -> bool {
        (self.start_ms..=self.end_ms).contains(&timestamp_ms)
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Storage for decoded samples.
pub trait HistoryStore: Send + Sync {
    /// Persist one sample.
    ///
    /// # Errors
    ///
    /// Backend-specific failure.
    fn insert(&self, sample: &Sample) -> HistoryResult<()>;

    /// Samples inside `window`, oldest first.
    ///
    /// # Errors
    ///
    /// Backend-specific failure.
    fn query(&self, window: TimeWindow) -> HistoryResult<Vec<Sample>>;
}

/// In-memory history.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    samples: RwLock<Vec<Sample>>,
}

impl MemoryHistory {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistory {
    fn insert(&self, sample: &Sample) -> HistoryResult<()> {
        self.samples
            .write()
            .map_err(|_| HistoryError::Locked)?
            .push(sample.clone());
        Ok(())
    }

    fn query(&self, window: TimeWindow) -> HistoryResult<Vec<Sample>> {
        let samples = self.samples.read().map_err(|_| HistoryError::Locked)?;
        let mut found: Vec<Sample> = samples
            .iter()
            .filter(|s| window.contains(s.timestamp_ms))
            .cloned()
            .collect();
        // Stable, so equal timestamps keep insertion order
        found.sort_by_key(|s| s.timestamp_ms);
        Ok(found)
    }
}
