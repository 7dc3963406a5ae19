//! Dispatchable actions and their outcomes.

use std::fmt;
use std::sync::Arc;

use crate::key::CacheKey;

/// Predicate over cache keys used by [`KeySelector::Matching`].
pub type KeyPredicate = Arc<dyn Fn(&CacheKey) -> bool + Send + Sync>;

/// Which cache keys an invalidation or eviction applies to.
#[derive(Clone)]
pub enum KeySelector {
    /// The key derived from the current parameters.
    Current,
    /// Every key the fetcher knows about.
    All,
    /// An explicit list of keys.
    Keys(Vec<CacheKey>),
    /// Every known key the predicate accepts.
    Matching(KeyPredicate),
}

impl KeySelector {
    /// Build a predicate selector.
    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&CacheKey) -> bool + Send + Sync + 'static,
    {
        Self::Matching(Arc::new(predicate))
    }

    /// Whether `key` is selected, given the current key.
    pub fn selects(&self, key: &CacheKey, current: &CacheKey) -> bool {
        match self {
            Self::Current => key == current,
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
            Self::Matching(predicate) => predicate(key),
        }
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("Current"),
            Self::All => f.write_str("All"),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Matching(_) => f.write_str("Matching(..)"),
        }
    }
}

/// An action processed by the fetch coordinator.
#[derive(Debug, Clone)]
pub enum Action {
    /// Fetch the current key if it is missing or stale.
    FetchData,
    /// Mark selected keys stale; their data stays readable until refetched.
    Invalidate(KeySelector),
    /// Remove selected entries immediately and mark them missing.
    Evict(KeySelector),
    /// Restore the cache to its construction-time entry.
    ResetCache,
}

impl Action {
    /// Invalidate only the current key.
    pub fn invalidate() -> Self {
        Self::Invalidate(KeySelector::Current)
    }

    /// Invalidate every key, like a single fetcher-wide stale flag would.
    pub fn invalidate_all() -> Self {
        Self::Invalidate(KeySelector::All)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchData => "fetch_data",
            Self::Invalidate(_) => "invalidate",
            Self::Evict(_) => "evict",
            Self::ResetCache => "reset_cache",
        }
    }
}

/// What a dispatch actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The fetch source was called and its result committed.
    Fetched,
    /// The current key was fresh; nothing was fetched.
    AlreadyFresh,
    /// Another dispatch was already fetching this key; its result was awaited.
    Joined,
    /// The fetch resolved after its key was invalidated, evicted or reset,
    /// so the result was dropped.
    Superseded,
    /// This many cached keys were marked stale.
    Invalidated(usize),
    /// This many entries were removed.
    Evicted(usize),
    /// The cache was restored to its initial entry.
    Reset,
}

impl DispatchOutcome {
    /// Whether this dispatch committed new data into the cache.
    pub fn committed(self) -> bool {
        matches!(self, Self::Fetched | Self::Joined)
    }
}
