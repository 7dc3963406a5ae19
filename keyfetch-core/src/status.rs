//! Per-key entry status and read metadata.
//!
//! Staleness is explicit: each cache key carries an [`EntryStatus`], and
//! reads that care about it get an [`EntryRead<D>`] carrying the state the
//! value was read in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of one cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    /// Cached and not marked for refetch.
    Fresh,
    /// Cached, but the next `FetchData` must refetch it.
    Stale,
    /// No entry.
    Missing,
}

impl EntryState {
    /// Whether `FetchData` has to call the fetch source for this key.
    pub fn needs_fetch(self) -> bool {
        !matches!(self, Self::Fresh)
    }

    /// Whether the key holds data.
    pub fn has_data(self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Status record for one cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub state: EntryState,
    /// When data was last committed under this key.
    pub last_updated: Option<DateTime<Utc>>,
    /// Bumped by invalidate, evict and reset. A fetch result is committed
    /// only if the generation it started under is still current.
    pub generation: u64,
}

impl EntryStatus {
    /// Status of a key that has never been seen.
    pub fn missing() -> Self {
        Self {
            state: EntryState::Missing,
            last_updated: None,
            generation: 0,
        }
    }

    /// Age of the data under this key, if any was ever committed.
    pub fn age(&self) -> Option<Duration> {
        self.last_updated.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

impl Default for EntryStatus {
    fn default() -> Self {
        Self::missing()
    }
}

/// A cached value together with the state it was read in.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRead<D> {
    value: D,
    state: EntryState,
    last_updated: Option<DateTime<Utc>>,
}

impl<D> EntryRead<D> {
    pub fn new(value: D, status: &EntryStatus) -> Self {
        Self {
            value,
            state: status.state,
            last_updated: status.last_updated,
        }
    }

    pub fn value(&self) -> &D {
        &self.value
    }

    pub fn into_value(self) -> D {
        self.value
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// True if the value is being served while a refetch is due.
    pub fn is_stale(&self) -> bool {
        self.state == EntryState::Stale
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> EntryRead<U>
    where
        F: FnOnce(D) -> U,
    {
        EntryRead {
            value: f(self.value),
            state: self.state,
            last_updated: self.last_updated,
        }
    }
}

impl<D> AsRef<D> for EntryRead<D> {
    fn as_ref(&self) -> &D {
        &self.value
    }
}

/// Counters describing how the fetcher has been used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// `FetchData` dispatches answered from a fresh entry.
    pub hits: u64,
    /// `FetchData` dispatches that needed the fetch source.
    pub misses: u64,
    /// Calls actually issued to the fetch source.
    pub fetches: u64,
    /// Fetch source calls that failed.
    pub failures: u64,
    /// Dispatches that waited on someone else's in-flight fetch.
    pub joined: u64,
    /// Fetch results dropped because their generation was outdated.
    pub superseded: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
