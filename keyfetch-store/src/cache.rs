//! Versioned, copy-on-write cache store.
//!
//! Every commit builds a new map behind a new `Arc` and bumps the store
//! version. A [`CacheSnapshot`] taken before a commit keeps seeing the old
//! map, so identity and version comparisons both detect change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use keyfetch_core::{CacheKey, FetchData, KeyfetchResult, StoreError};

use crate::derived::VersionSource;

/// Immutable view of the cache at one version.
#[derive(Debug)]
pub struct CacheSnapshot<D> {
    entries: Arc<HashMap<CacheKey, D>>,
    version: u64,
}

impl<D> Clone for CacheSnapshot<D> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            version: self.version,
        }
    }
}

impl<D> CacheSnapshot<D> {
    pub fn get(&self, key: &CacheKey) -> Option<&D> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True if both snapshots share the same backing map.
    pub fn same_map(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

/// Mapping from cache key to cached data.
pub struct CacheStore<D> {
    current: RwLock<CacheSnapshot<D>>,
}

impl<D: FetchData> CacheStore<D> {
    /// Create a store holding exactly one entry.
    pub fn new(initial_key: CacheKey, initial_data: D) -> Self {
        let mut entries = HashMap::with_capacity(1);
        entries.insert(initial_key, initial_data);
        Self {
            current: RwLock::new(CacheSnapshot {
                entries: Arc::new(entries),
                version: 0,
            }),
        }
    }

    /// Read one entry.
    pub fn read(&self, key: &CacheKey) -> KeyfetchResult<Option<D>> {
        let current = self
            .current
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "cache" })?;
        Ok(current.get(key).cloned())
    }

    /// The whole cache at its current version.
    pub fn snapshot(&self) -> KeyfetchResult<CacheSnapshot<D>> {
        let current = self
            .current
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "cache" })?;
        Ok(current.clone())
    }

    /// Replace exactly one entry, leaving all others unchanged.
    ///
    /// Returns the new version.
    pub fn commit_replace_one(&self, key: CacheKey, data: D) -> KeyfetchResult<u64> {
        self.commit(|entries| {
            entries.insert(key, data);
        })
    }

    /// Discard every entry and keep exactly one.
    pub fn commit_reset_all(&self, initial_key: CacheKey, initial_data: D) -> KeyfetchResult<u64> {
        let mut entries = HashMap::with_capacity(1);
        entries.insert(initial_key, initial_data);
        self.commit_replace_all(entries)
    }

    /// Replace the entire backing map.
    pub fn commit_replace_all(&self, entries: HashMap<CacheKey, D>) -> KeyfetchResult<u64> {
        let mut current = self
            .current
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "cache" })?;
        let version = current.version + 1;
        *current = CacheSnapshot {
            entries: Arc::new(entries),
            version,
        };
        Ok(version)
    }

    /// Insert or replace several entries in one commit.
    pub fn commit_merge(&self, updates: HashMap<CacheKey, D>) -> KeyfetchResult<u64> {
        self.commit(|entries| entries.extend(updates))
    }

    /// Copy the current map, apply `f`, and publish the result.
    fn commit<F>(&self, f: F) -> KeyfetchResult<u64>
    where
        F: FnOnce(&mut HashMap<CacheKey, D>),
    {
        let mut current = self
            .current
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "cache" })?;
        let mut next = (*current.entries).clone();
        f(&mut next);
        let version = current.version + 1;
        *current = CacheSnapshot {
            entries: Arc::new(next),
            version,
        };
        Ok(version)
    }
}

impl<D: FetchData> VersionSource for CacheStore<D> {
    fn version(&self) -> KeyfetchResult<u64> {
        let current = self
            .current
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "cache" })?;
        Ok(current.version)
    }
}
