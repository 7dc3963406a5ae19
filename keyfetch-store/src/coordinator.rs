//! Fetch coordinator.
//!
//! Owns the stores and drives the per-key state machine:
//!
//! ```text
//! Missing --fetch ok--> Fresh --invalidate--> Stale --fetch ok--> Fresh
//!    ^                                                              |
//!    +--------------------------- reset / evict --------------------+
//! ```
//!
//! A failed fetch changes nothing and is reported to the dispatcher.
//!
//! # Concurrency
//!
//! Store reads and writes are synchronous. The call into the fetch source is
//! the only suspension point. All mutations go through one commit lock, so
//! the "is this generation still current" check and the cache write happen
//! as a single step.
//!
//! With deduplication on, the first dispatch for a key becomes the leader
//! and registers an in-flight marker holding a `watch` receiver. Later
//! dispatches for the same key and generation wait on that receiver instead
//! of calling the source again. The marker is removed when the leader
//! finishes or is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use keyfetch_core::{
    Action, CacheKey, CacheStats, DispatchOutcome, EntryState, FetchData, FetchError,
    FetchParams, FetcherConfig, KeySelector, KeyfetchError, KeyfetchResult, StoreError,
};
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::params::ParamStore;
use crate::source::FetchSource;
use crate::status::StatusTable;

type FetchResult = Result<DispatchOutcome, KeyfetchError>;
type InFlightMap = HashMap<u64, InFlight>;

/// Marker for one fetch currently awaiting the source.
struct InFlight {
    key: CacheKey,
    generation: u64,
    /// Set when the key is invalidated, evicted or reset mid-flight; a
    /// detached fetch is never joined.
    detached: bool,
    done: watch::Receiver<Option<FetchResult>>,
}

/// Removes the leader's marker however the leader exits.
struct InFlightGuard<'a> {
    map: &'a Mutex<InFlightMap>,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(&self.id);
        }
    }
}

enum Role {
    Fresh,
    Leader {
        id: u64,
        generation: u64,
        done: watch::Sender<Option<FetchResult>>,
    },
    Follower(watch::Receiver<Option<FetchResult>>),
}

/// Orchestrates fetch decisions and commits results into the stores.
pub struct FetchCoordinator<P, D> {
    source: Arc<dyn FetchSource<P, D>>,
    params: Arc<ParamStore<P>>,
    cache: Arc<CacheStore<D>>,
    statuses: Arc<StatusTable>,
    config: FetcherConfig,
    initial_key: CacheKey,
    initial_data: D,
    commit_lock: Mutex<()>,
    in_flight: Mutex<InFlightMap>,
    next_fetch_id: AtomicU64,
    stats: Mutex<CacheStats>,
}

impl<P: FetchParams, D: FetchData> FetchCoordinator<P, D> {
    /// Build the stores around `initial_params` and `initial_data`.
    pub fn new(
        source: Arc<dyn FetchSource<P, D>>,
        initial_params: P,
        initial_data: D,
        config: FetcherConfig,
    ) -> KeyfetchResult<Self> {
        config.validate()?;
        let params = ParamStore::new(initial_params)?;
        let initial_key = params.key()?;
        let initial_state = initial_state(&config);

        Ok(Self {
            source,
            params: Arc::new(params),
            cache: Arc::new(CacheStore::new(initial_key.clone(), initial_data.clone())),
            statuses: Arc::new(StatusTable::new(initial_key.clone(), initial_state)),
            config,
            initial_key,
            initial_data,
            commit_lock: Mutex::new(()),
            in_flight: Mutex::new(HashMap::new()),
            next_fetch_id: AtomicU64::new(0),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn params(&self) -> &Arc<ParamStore<P>> {
        &self.params
    }

    pub fn cache(&self) -> &Arc<CacheStore<D>> {
        &self.cache
    }

    pub fn statuses(&self) -> &Arc<StatusTable> {
        &self.statuses
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn initial_key(&self) -> &CacheKey {
        &self.initial_key
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Process one action.
    pub async fn dispatch(&self, action: Action) -> KeyfetchResult<DispatchOutcome> {
        tracing::debug!(action = action.name(), "Dispatching fetcher action");
        match action {
            Action::FetchData => self.fetch_current().await,
            Action::Invalidate(selector) => self.invalidate(&selector),
            Action::Evict(selector) => self.evict(&selector),
            Action::ResetCache => self.reset(),
        }
    }

    /// Fetch the current key if it is missing or stale.
    async fn fetch_current(&self) -> KeyfetchResult<DispatchOutcome> {
        let (params, key) = self.params.snapshot()?;

        match self.claim(&key)? {
            Role::Fresh => {
                self.bump(|s| s.hits += 1);
                tracing::debug!(key = %key.fingerprint(), "Entry fresh, skipping fetch");
                Ok(DispatchOutcome::AlreadyFresh)
            }
            Role::Follower(rx) => {
                self.bump(|s| {
                    s.misses += 1;
                    s.joined += 1;
                });
                tracing::debug!(key = %key.fingerprint(), "Joining in-flight fetch");
                wait_for_leader(rx, &key).await
            }
            Role::Leader {
                id,
                generation,
                done,
            } => {
                self.bump(|s| s.misses += 1);
                let _guard = InFlightGuard {
                    map: &self.in_flight,
                    id,
                };
                let result = self.run_fetch(params, &key, generation).await;
                done.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Decide what a fetch of `key` does: skip it, follow a running leader,
    /// or lead a new fetch.
    ///
    /// The status is read while the in-flight map is locked, so a leader
    /// that commits between the read and the registration cannot be missed.
    fn claim(&self, key: &CacheKey) -> KeyfetchResult<Role> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "in_flight" })?;

        let status = self.statuses.get(key)?;
        if !status.state.needs_fetch() {
            return Ok(Role::Fresh);
        }

        if self.config.dedupe_in_flight {
            let existing = map
                .values()
                .find(|f| !f.detached && &f.key == key && f.generation == status.generation);
            if let Some(flight) = existing {
                return Ok(Role::Follower(flight.done.clone()));
            }
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        map.insert(
            id,
            InFlight {
                key: key.clone(),
                generation: status.generation,
                detached: false,
                done: rx,
            },
        );
        Ok(Role::Leader {
            id,
            generation: status.generation,
            done: tx,
        })
    }

    async fn run_fetch(&self, params: P, key: &CacheKey, generation: u64) -> FetchResult {
        self.bump(|s| s.fetches += 1);
        tracing::debug!(key = %key.fingerprint(), generation, "Fetching from source");

        match self.source.fetch(params).await {
            Ok(data) => self.commit_fetched(key, generation, data),
            Err(e) => {
                self.bump(|s| s.failures += 1);
                let err = e.for_key(key.as_str());
                tracing::warn!(key = %key.fingerprint(), error = %err, "Fetch failed, cache unchanged");
                Err(err.into())
            }
        }
    }

    /// Commit a fetch result if its generation is still current.
    fn commit_fetched(&self, key: &CacheKey, generation: u64, data: D) -> FetchResult {
        let _lock = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "commit" })?;

        if self.config.drop_superseded && !self.statuses.is_current(key, generation)? {
            self.bump(|s| s.superseded += 1);
            tracing::warn!(
                key = %key.fingerprint(),
                generation,
                "Dropping fetch result superseded while in flight"
            );
            return Ok(DispatchOutcome::Superseded);
        }

        let version = self.cache.commit_replace_one(key.clone(), data)?;
        self.statuses.mark_fetched(key, None)?;
        tracing::debug!(key = %key.fingerprint(), version, "Committed fetch result");
        Ok(DispatchOutcome::Fetched)
    }

    fn invalidate(&self, selector: &KeySelector) -> KeyfetchResult<DispatchOutcome> {
        let _lock = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "commit" })?;
        let current = self.params.key()?;
        let (selected, with_data) = self.statuses.invalidate(selector, &current)?;
        self.detach(|k| selected.contains(k))?;
        tracing::debug!(?selector, invalidated = with_data, "Marked entries stale");
        Ok(DispatchOutcome::Invalidated(with_data))
    }

    fn evict(&self, selector: &KeySelector) -> KeyfetchResult<DispatchOutcome> {
        let _lock = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "commit" })?;
        let current = self.params.key()?;
        let evicted = self.statuses.evict(selector, &current)?;

        let snapshot = self.cache.snapshot()?;
        let remaining: HashMap<CacheKey, D> = snapshot
            .keys()
            .filter(|k| !evicted.contains(k))
            .filter_map(|k| snapshot.get(k).map(|d| (k.clone(), d.clone())))
            .collect();
        self.cache.commit_replace_all(remaining)?;
        self.detach(|k| selector.selects(k, &current))?;

        tracing::debug!(?selector, evicted = evicted.len(), "Evicted entries");
        Ok(DispatchOutcome::Evicted(evicted.len()))
    }

    fn reset(&self) -> KeyfetchResult<DispatchOutcome> {
        let _lock = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "commit" })?;
        self.cache
            .commit_reset_all(self.initial_key.clone(), self.initial_data.clone())?;
        self.statuses
            .reset(&self.initial_key, initial_state(&self.config))?;
        self.detach(|_| true)?;
        tracing::debug!("Cache reset to initial entry");
        Ok(DispatchOutcome::Reset)
    }

    /// Write data under `key` directly, bypassing the fetch source.
    pub fn write(&self, updates: HashMap<CacheKey, D>) -> KeyfetchResult<()> {
        let _lock = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "commit" })?;
        let keys: Vec<CacheKey> = updates.keys().cloned().collect();
        self.cache.commit_merge(updates)?;
        for key in &keys {
            self.statuses.mark_written(key)?;
        }
        Ok(())
    }

    /// Stop new dispatches from joining in-flight fetches for matching keys.
    fn detach<F>(&self, matches: F) -> KeyfetchResult<()>
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "in_flight" })?;
        for flight in map.values_mut().filter(|f| matches(&f.key)) {
            flight.detached = true;
        }
        Ok(())
    }

    /// Number of fetches currently awaiting the source.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether a joinable fetch for `key` is in flight.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight
            .lock()
            .map(|m| m.values().any(|f| !f.detached && &f.key == key))
            .unwrap_or(false)
    }

    /// Wait until no fetch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<_> = match self.in_flight.lock() {
                Ok(map) => map
                    .values()
                    .filter(|f| f.done.borrow().is_none())
                    .map(|f| f.done.clone())
                    .collect(),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            for mut rx in pending {
                let _ = rx.wait_for(|v| v.is_some()).await;
            }
        }
    }

    fn bump<F: FnOnce(&mut CacheStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

fn initial_state(config: &FetcherConfig) -> EntryState {
    if config.initial_stale {
        EntryState::Stale
    } else {
        EntryState::Fresh
    }
}

async fn wait_for_leader(
    mut rx: watch::Receiver<Option<FetchResult>>,
    key: &CacheKey,
) -> KeyfetchResult<DispatchOutcome> {
    let result = match rx.wait_for(|v| v.is_some()).await {
        Ok(done) => done.clone(),
        Err(_) => None,
    };
    match result {
        Some(Ok(DispatchOutcome::Fetched)) => Ok(DispatchOutcome::Joined),
        Some(other) => other,
        None => Err(FetchError::Abandoned {
            key: key.to_string(),
        }
        .into()),
    }
}
