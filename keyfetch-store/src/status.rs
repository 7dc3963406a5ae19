//! Per-key status table.
//!
//! Replaces a single fetcher-wide stale flag with one [`EntryStatus`] per
//! cache key, so invalidation only touches the keys it selects. Entries are
//! never dropped from the table: a key that goes back to `Missing` keeps its
//! generation, which therefore only ever grows.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use keyfetch_core::{CacheKey, EntryState, EntryStatus, KeySelector, KeyfetchResult, StoreError};

use crate::derived::VersionSource;

#[derive(Default)]
struct StatusState {
    statuses: HashMap<CacheKey, EntryStatus>,
    version: u64,
}

/// Status record for every key the fetcher has seen.
#[derive(Default)]
pub struct StatusTable {
    state: RwLock<StatusState>,
}

impl StatusTable {
    /// Create a table with the construction-time entry in `initial_state`.
    pub fn new(initial_key: CacheKey, initial_state: EntryState) -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(
            initial_key,
            EntryStatus {
                state: initial_state,
                last_updated: Some(Utc::now()),
                generation: 0,
            },
        );
        Self {
            state: RwLock::new(StatusState {
                statuses,
                version: 0,
            }),
        }
    }

    /// Status of `key`; unknown keys are `Missing`.
    pub fn get(&self, key: &CacheKey) -> KeyfetchResult<EntryStatus> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "status" })?;
        Ok(state.statuses.get(key).cloned().unwrap_or_default())
    }

    /// Every key with a status record, including ones back at `Missing`.
    pub fn keys(&self) -> KeyfetchResult<Vec<CacheKey>> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "status" })?;
        Ok(state.statuses.keys().cloned().collect())
    }

    /// Mark a fetch result under `key` as committed.
    ///
    /// When `generation` is given it must match the key's current
    /// generation, otherwise nothing changes and `false` is returned.
    pub fn mark_fetched(&self, key: &CacheKey, generation: Option<u64>) -> KeyfetchResult<bool> {
        self.modify(|state| {
            let status = state.statuses.entry(key.clone()).or_default();
            if generation.is_some_and(|g| g != status.generation) {
                return false;
            }
            status.state = EntryState::Fresh;
            status.last_updated = Some(Utc::now());
            true
        })
    }

    /// Whether `generation` is still the current generation of `key`.
    pub fn is_current(&self, key: &CacheKey, generation: u64) -> KeyfetchResult<bool> {
        Ok(self.get(key)?.generation == generation)
    }

    /// Record a manual write. A missing key becomes `Fresh`; a stale key
    /// stays stale, since the write does not come from the source.
    pub fn mark_written(&self, key: &CacheKey) -> KeyfetchResult<()> {
        self.modify(|state| {
            let status = state.statuses.entry(key.clone()).or_default();
            if status.state == EntryState::Missing {
                status.state = EntryState::Fresh;
            }
            status.last_updated = Some(Utc::now());
        })
    }

    /// Mark selected keys stale and bump their generation.
    ///
    /// Returns the selected keys; the count of keys that actually held data
    /// is the second element.
    pub fn invalidate(
        &self,
        selector: &KeySelector,
        current: &CacheKey,
    ) -> KeyfetchResult<(Vec<CacheKey>, usize)> {
        self.modify(|state| {
            let selected = select(state, selector, current);
            let mut with_data = 0;
            for key in &selected {
                let status = state.statuses.entry(key.clone()).or_default();
                status.generation += 1;
                if status.state.has_data() {
                    status.state = EntryState::Stale;
                    with_data += 1;
                }
            }
            (selected, with_data)
        })
    }

    /// Mark selected keys missing and bump their generation.
    ///
    /// Returns the keys that held data before the call.
    pub fn evict(&self, selector: &KeySelector, current: &CacheKey) -> KeyfetchResult<Vec<CacheKey>> {
        self.modify(|state| {
            let selected = select(state, selector, current);
            let mut evicted = Vec::new();
            for key in selected {
                let status = state.statuses.entry(key.clone()).or_default();
                status.generation += 1;
                if status.state.has_data() {
                    status.state = EntryState::Missing;
                    evicted.push(key);
                }
            }
            evicted
        })
    }

    /// Send every key back to `Missing` except the initial one, which
    /// returns to `initial_state`. All generations are bumped.
    pub fn reset(&self, initial_key: &CacheKey, initial_state: EntryState) -> KeyfetchResult<()> {
        self.modify(|state| {
            for status in state.statuses.values_mut() {
                status.state = EntryState::Missing;
                status.generation += 1;
            }
            let initial = state.statuses.entry(initial_key.clone()).or_default();
            initial.state = initial_state;
            initial.last_updated = Some(Utc::now());
        })
    }

    fn modify<T, F>(&self, f: F) -> KeyfetchResult<T>
    where
        F: FnOnce(&mut StatusState) -> T,
    {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "status" })?;
        let out = f(&mut state);
        state.version += 1;
        Ok(out)
    }
}

/// Resolve a selector against the known keys. `Current` and explicit keys
/// are selected even if the table has never seen them.
fn select(state: &StatusState, selector: &KeySelector, current: &CacheKey) -> Vec<CacheKey> {
    match selector {
        KeySelector::Current => vec![current.clone()],
        KeySelector::Keys(keys) => keys.clone(),
        _ => state
            .statuses
            .keys()
            .filter(|k| selector.selects(k, current))
            .cloned()
            .collect(),
    }
}

impl VersionSource for StatusTable {
    fn version(&self) -> KeyfetchResult<u64> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "status" })?;
        Ok(state.version)
    }
}
