//! Parameter store.
//!
//! Holds the current parameters together with the cache key derived from
//! them. The key is recomputed on every write, so readers never see
//! parameters and key out of sync.

use std::sync::RwLock;

use keyfetch_core::{derive_key, CacheKey, FetchParams, KeyfetchResult, StoreError};

use crate::derived::VersionSource;

struct ParamState<P> {
    params: P,
    key: CacheKey,
    version: u64,
}

/// Consumer-writable store for the current parameters.
pub struct ParamStore<P> {
    state: RwLock<ParamState<P>>,
}

impl<P: FetchParams> ParamStore<P> {
    /// Create a store holding `params`.
    ///
    /// Fails if the parameters cannot be turned into a cache key; this is the
    /// construction-time configuration error.
    pub fn new(params: P) -> KeyfetchResult<Self> {
        let key = derive_key(&params)?;
        Ok(Self {
            state: RwLock::new(ParamState {
                params,
                key,
                version: 0,
            }),
        })
    }

    /// Current parameters.
    pub fn get(&self) -> KeyfetchResult<P> {
        Ok(self.read()?.params.clone())
    }

    /// Cache key for the current parameters.
    pub fn key(&self) -> KeyfetchResult<CacheKey> {
        Ok(self.read()?.key.clone())
    }

    /// Parameters and their key, read together.
    pub fn snapshot(&self) -> KeyfetchResult<(P, CacheKey)> {
        let state = self.read()?;
        Ok((state.params.clone(), state.key.clone()))
    }

    /// Replace the parameters.
    ///
    /// Returns `true` if the cache key changed. Writing parameters that
    /// derive the same key is a no-op and does not bump the version.
    pub fn set(&self, params: P) -> KeyfetchResult<bool> {
        let key = derive_key(&params)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned { store: "params" })?;
        if state.key == key {
            return Ok(false);
        }
        state.params = params;
        state.key = key;
        state.version += 1;
        Ok(true)
    }

    /// Derive new parameters from the current ones and store them.
    pub fn update<F>(&self, f: F) -> KeyfetchResult<bool>
    where
        F: FnOnce(&P) -> P,
    {
        let next = f(&self.get()?);
        self.set(next)
    }

    fn read(&self) -> KeyfetchResult<std::sync::RwLockReadGuard<'_, ParamState<P>>> {
        self.state
            .read()
            .map_err(|_| StoreError::LockPoisoned { store: "params" }.into())
    }
}

impl<P: FetchParams> VersionSource for ParamStore<P> {
    fn version(&self) -> KeyfetchResult<u64> {
        Ok(self.read()?.version)
    }
}
