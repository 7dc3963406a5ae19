//! The fetcher: construction bundle and consumer-facing handles.

use std::collections::HashMap;
use std::sync::Arc;

use keyfetch_core::{
    derive_key, Action, CacheKey, CacheStats, DispatchOutcome, EntryRead, EntryState, EntryStatus,
    FetchData, FetchParams, FetcherConfig, KeyfetchError, KeyfetchResult, StoreError,
};
use tokio::sync::watch;

use crate::cache::CacheSnapshot;
use crate::coordinator::FetchCoordinator;
use crate::derived::{DerivedView, VersionSource};
use crate::source::FetchSource;
use crate::trigger::{AutoFetch, TriggerSignature};

/// Construction options.
#[derive(Debug, Clone)]
pub struct FetcherOptions<P, D> {
    /// Data held under the initial key before anything is fetched.
    pub initial_data: D,
    /// Parameters the fetcher starts with.
    pub initial_params: P,
    pub config: FetcherConfig,
}

impl<P, D> FetcherOptions<P, D> {
    pub fn new(initial_params: P, initial_data: D) -> Self {
        Self {
            initial_data,
            initial_params,
            config: FetcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FetcherConfig) -> Self {
        self.config = config;
        self
    }
}

struct FetcherInner<P, D> {
    coordinator: FetchCoordinator<P, D>,
    trigger: AutoFetch,
    /// Fetches spawned by the trigger that have not finished yet.
    scheduled: watch::Sender<usize>,
}

/// Decrements the scheduled count however the spawned task ends.
struct ScheduledGuard<P, D>(Fetcher<P, D>);

impl<P, D> Drop for ScheduledGuard<P, D> {
    fn drop(&mut self) {
        self.0.inner.scheduled.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Parameter-keyed cache in front of a fetch source.
///
/// Cheap to clone; all clones share the same stores.
///
/// # Example
///
/// ```ignore
/// let fetcher = Fetcher::new(from_fn(get_todos), FetcherOptions::new(json!({}), vec![]))?;
///
/// // Explicit: fetch if missing or stale, then read.
/// let todos = fetcher.ensure_loaded().await?;
///
/// // Pure read, never fetches.
/// let cached = fetcher.current()?;
///
/// // Read, and schedule a fetch in the background if one is due.
/// let shown = fetcher.observe()?;
/// ```
pub struct Fetcher<P, D> {
    inner: Arc<FetcherInner<P, D>>,
}

impl<P, D> Clone for Fetcher<P, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: FetchParams, D: FetchData> Fetcher<P, D> {
    /// Create a fetcher.
    ///
    /// Fails if the initial parameters cannot be turned into a cache key or
    /// the config does not validate.
    pub fn new<S>(source: S, options: FetcherOptions<P, D>) -> KeyfetchResult<Self>
    where
        S: FetchSource<P, D> + 'static,
    {
        Self::from_shared(Arc::new(source), options)
    }

    /// Create a fetcher around an already shared source.
    pub fn from_shared(
        source: Arc<dyn FetchSource<P, D>>,
        options: FetcherOptions<P, D>,
    ) -> KeyfetchResult<Self> {
        let coordinator = FetchCoordinator::new(
            source,
            options.initial_params,
            options.initial_data,
            options.config,
        )?;
        tracing::debug!(
            initial_key = %coordinator.initial_key().fingerprint(),
            "Fetcher created"
        );
        Ok(Self {
            inner: Arc::new(FetcherInner {
                coordinator,
                trigger: AutoFetch::new(),
                scheduled: watch::Sender::new(0),
            }),
        })
    }

    /// Split into the handle bundle.
    pub fn handles(&self) -> FetcherHandles<P, D> {
        FetcherHandles {
            data: DataHandle(self.clone()),
            dispatch: DispatchHandle(self.clone()),
            params: ParamsHandle(self.clone()),
            current_entry: CurrentEntryHandle(self.clone()),
            cache_key: CacheKeyHandle(self.clone()),
        }
    }

    fn coordinator(&self) -> &FetchCoordinator<P, D> {
        &self.inner.coordinator
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub async fn dispatch(&self, action: Action) -> KeyfetchResult<DispatchOutcome> {
        self.coordinator().dispatch(action).await
    }

    /// Fetch the current key if it is missing or stale, then read it.
    pub async fn ensure_loaded(&self) -> KeyfetchResult<Option<D>> {
        self.dispatch(Action::FetchData).await?;
        self.current()
    }

    /// Wait until every scheduled and in-flight fetch has resolved.
    pub async fn wait_idle(&self) {
        let mut scheduled = self.inner.scheduled.subscribe();
        let _ = scheduled.wait_for(|n| *n == 0).await;
        self.coordinator().wait_idle().await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Data under the current key. Never fetches.
    pub fn current(&self) -> KeyfetchResult<Option<D>> {
        let key = self.cache_key()?;
        self.coordinator().cache().read(&key)
    }

    /// Data under the current key, with the state it was read in.
    pub fn current_read(&self) -> KeyfetchResult<Option<EntryRead<D>>> {
        let key = self.cache_key()?;
        let status = self.coordinator().statuses().get(&key)?;
        let data = self.coordinator().cache().read(&key)?;
        Ok(data.map(|d| EntryRead::new(d, &status)))
    }

    /// Read the current data and schedule a fetch if one is due.
    ///
    /// The fetch runs on the ambient tokio runtime. Without one, the read
    /// still succeeds and the fetch is skipped with a warning.
    pub fn observe(&self) -> KeyfetchResult<Option<D>> {
        self.poke()?;
        self.current()
    }

    /// Data cached for arbitrary parameters, without switching to them.
    ///
    /// Parameters that cannot be turned into a key are simply a miss.
    pub fn peek(&self, params: &P) -> Option<D> {
        let key = derive_key(params).ok()?;
        self.coordinator().cache().read(&key).ok().flatten()
    }

    pub fn snapshot(&self) -> KeyfetchResult<CacheSnapshot<D>> {
        self.coordinator().cache().snapshot()
    }

    pub fn status(&self, key: &CacheKey) -> KeyfetchResult<EntryStatus> {
        self.coordinator().statuses().get(key)
    }

    pub fn state_of_current(&self) -> KeyfetchResult<EntryState> {
        Ok(self.status(&self.cache_key()?)?.state)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.coordinator().is_in_flight(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.coordinator().stats()
    }

    pub fn config(&self) -> &FetcherConfig {
        self.coordinator().config()
    }

    // ------------------------------------------------------------------
    // Parameters and key
    // ------------------------------------------------------------------

    pub fn params(&self) -> KeyfetchResult<P> {
        self.coordinator().params().get()
    }

    pub fn cache_key(&self) -> KeyfetchResult<CacheKey> {
        self.coordinator().params().key()
    }

    /// Replace the parameters. Returns `true` if the cache key changed.
    pub fn set_params(&self, params: P) -> KeyfetchResult<bool> {
        let changed = self.coordinator().params().set(params)?;
        self.after_params_change(changed)?;
        Ok(changed)
    }

    pub fn update_params<F>(&self, f: F) -> KeyfetchResult<bool>
    where
        F: FnOnce(&P) -> P,
    {
        let changed = self.coordinator().params().update(f)?;
        self.after_params_change(changed)?;
        Ok(changed)
    }

    fn after_params_change(&self, changed: bool) -> KeyfetchResult<()> {
        if changed {
            tracing::debug!(key = %self.cache_key()?.fingerprint(), "Parameters changed");
            if self.config().auto_fetch_on_params_change {
                self.poke()?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Manual cache edits
    // ------------------------------------------------------------------

    /// Overwrite the data under the current key.
    pub fn set_current(&self, data: D) -> KeyfetchResult<()> {
        let mut updates = HashMap::with_capacity(1);
        updates.insert(self.cache_key()?, data);
        self.merge(updates)
    }

    /// Insert or replace several entries in one commit.
    pub fn merge(&self, updates: HashMap<CacheKey, D>) -> KeyfetchResult<()> {
        self.coordinator().write(updates)
    }

    // ------------------------------------------------------------------
    // Derived views
    // ------------------------------------------------------------------

    /// Upstream handle for the cache store, for custom views.
    pub fn cache_source(&self) -> Arc<dyn VersionSource> {
        Arc::clone(self.coordinator().cache()) as Arc<dyn VersionSource>
    }

    /// Upstream handle for the parameter store, for custom views.
    pub fn params_source(&self) -> Arc<dyn VersionSource> {
        Arc::clone(self.coordinator().params()) as Arc<dyn VersionSource>
    }

    /// Upstream handle for the status table, for custom views.
    pub fn status_source(&self) -> Arc<dyn VersionSource> {
        Arc::clone(self.coordinator().statuses()) as Arc<dyn VersionSource>
    }

    /// View over the current entry. An absent entry reads as `D::default()`.
    pub fn derive_current<T, F>(&self, f: F) -> DerivedView<T>
    where
        D: Default,
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&D) -> T + Send + Sync + 'static,
    {
        let fetcher = self.clone();
        DerivedView::new(
            vec![self.cache_source(), self.params_source()],
            move || {
                let data = fetcher.current()?.unwrap_or_default();
                Ok(f(&data))
            },
        )
    }

    // ------------------------------------------------------------------
    // Auto-fetch glue
    // ------------------------------------------------------------------

    /// Compare the current signature with the last one and schedule a fetch
    /// if it changed and the key needs one.
    fn poke(&self) -> KeyfetchResult<bool> {
        let key = self.cache_key()?;
        let status = self.status(&key)?;
        let signature = TriggerSignature::new(key, &status);
        if !self.inner.trigger.observe(signature)? {
            return Ok(false);
        }
        self.schedule_fetch()
    }

    fn schedule_fetch(&self) -> KeyfetchResult<bool> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                let err = KeyfetchError::from(StoreError::NoRuntime);
                tracing::warn!(error = %err, "Skipping scheduled fetch");
                self.inner.trigger.forget();
                return Ok(false);
            }
        };

        self.inner.scheduled.send_modify(|n| *n += 1);
        let guard = ScheduledGuard(self.clone());
        handle.spawn(async move {
            let fetcher = &guard.0;
            match fetcher.dispatch(Action::FetchData).await {
                Ok(DispatchOutcome::Superseded) => fetcher.inner.trigger.forget(),
                Ok(outcome) => {
                    tracing::debug!(?outcome, "Scheduled fetch finished");
                }
                Err(e) => {
                    // Re-arm so the next observation retries.
                    fetcher.inner.trigger.forget();
                    tracing::warn!(error = %e, "Scheduled fetch failed");
                }
            }
        });
        Ok(true)
    }
}

/// The bundle returned by [`create_fetcher`].
pub struct FetcherHandles<P, D> {
    pub data: DataHandle<P, D>,
    pub dispatch: DispatchHandle<P, D>,
    pub params: ParamsHandle<P, D>,
    pub current_entry: CurrentEntryHandle<P, D>,
    pub cache_key: CacheKeyHandle<P, D>,
}

impl<P: FetchParams, D: FetchData> FetcherHandles<P, D> {
    /// The shared fetcher behind every handle.
    pub fn fetcher(&self) -> &Fetcher<P, D> {
        &self.data.0
    }
}

/// Create a fetcher and split it into handles.
pub fn create_fetcher<P, D, S>(
    source: S,
    options: FetcherOptions<P, D>,
) -> KeyfetchResult<FetcherHandles<P, D>>
where
    P: FetchParams,
    D: FetchData,
    S: FetchSource<P, D> + 'static,
{
    Ok(Fetcher::new(source, options)?.handles())
}

/// Read side of the current data.
#[derive(Clone)]
pub struct DataHandle<P, D>(Fetcher<P, D>);

impl<P: FetchParams, D: FetchData> DataHandle<P, D> {
    /// Pure read.
    pub fn current(&self) -> KeyfetchResult<Option<D>> {
        self.0.current()
    }

    /// Read, scheduling a fetch if one is due.
    pub fn observe(&self) -> KeyfetchResult<Option<D>> {
        self.0.observe()
    }

    /// Fetch if needed, then read.
    pub async fn ensure_loaded(&self) -> KeyfetchResult<Option<D>> {
        self.0.ensure_loaded().await
    }
}

/// Dispatch side.
#[derive(Clone)]
pub struct DispatchHandle<P, D>(Fetcher<P, D>);

impl<P: FetchParams, D: FetchData> DispatchHandle<P, D> {
    pub async fn dispatch(&self, action: Action) -> KeyfetchResult<DispatchOutcome> {
        self.0.dispatch(action).await
    }
}

/// Read/write access to the parameters.
#[derive(Clone)]
pub struct ParamsHandle<P, D>(Fetcher<P, D>);

impl<P: FetchParams, D: FetchData> ParamsHandle<P, D> {
    pub fn get(&self) -> KeyfetchResult<P> {
        self.0.params()
    }

    pub fn set(&self, params: P) -> KeyfetchResult<bool> {
        self.0.set_params(params)
    }

    pub fn update<F>(&self, f: F) -> KeyfetchResult<bool>
    where
        F: FnOnce(&P) -> P,
    {
        self.0.update_params(f)
    }
}

/// Read/write access to the current cache entry, bypassing the fetch source.
#[derive(Clone)]
pub struct CurrentEntryHandle<P, D>(Fetcher<P, D>);

impl<P: FetchParams, D: FetchData> CurrentEntryHandle<P, D> {
    pub fn get(&self) -> KeyfetchResult<Option<D>> {
        self.0.current()
    }

    pub fn set(&self, data: D) -> KeyfetchResult<()> {
        self.0.set_current(data)
    }

    pub fn merge(&self, updates: HashMap<CacheKey, D>) -> KeyfetchResult<()> {
        self.0.merge(updates)
    }
}

/// Read-only access to the current cache key.
#[derive(Clone)]
pub struct CacheKeyHandle<P, D>(Fetcher<P, D>);

impl<P: FetchParams, D: FetchData> CacheKeyHandle<P, D> {
    pub fn get(&self) -> KeyfetchResult<CacheKey> {
        self.0.cache_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::from_fn;
    use serde_json::{json, Value};

    fn echo_handles(config: FetcherConfig) -> FetcherHandles<Value, Value> {
        let source = from_fn(|params: Value| async move { Ok::<_, String>(params) });
        create_fetcher(
            source,
            FetcherOptions::new(json!({}), Value::Null).with_config(config),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_handles_share_one_fetcher() {
        let handles = echo_handles(FetcherConfig::default());
        handles.params.set(json!({"page": 2})).unwrap();
        assert_eq!(
            handles.cache_key.get().unwrap().as_str(),
            r#"{"page":2}"#
        );
        assert_eq!(handles.data.current().unwrap(), None);

        assert_eq!(
            handles.dispatch.dispatch(Action::FetchData).await.unwrap(),
            DispatchOutcome::Fetched
        );
        assert_eq!(
            handles.current_entry.get().unwrap(),
            Some(json!({"page": 2}))
        );
        assert_eq!(handles.fetcher().stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_switch_params() {
        let handles = echo_handles(FetcherConfig::new().with_initial_stale(false));
        let fetcher = handles.fetcher();
        fetcher.set_params(json!({"page": 1})).unwrap();
        fetcher.ensure_loaded().await.unwrap();
        fetcher.set_params(json!({})).unwrap();

        assert_eq!(fetcher.peek(&json!({"page": 1})), Some(json!({"page": 1})));
        assert_eq!(fetcher.peek(&json!({"page": 9})), None);
        assert_eq!(fetcher.params().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_auto_fetch_on_params_change() {
        let handles = echo_handles(FetcherConfig::new().with_auto_fetch(true));
        handles.params.update(|_| json!({"page": 3})).unwrap();
        handles.fetcher().wait_idle().await;
        assert_eq!(handles.data.current().unwrap(), Some(json!({"page": 3})));
        assert_eq!(
            handles.fetcher().state_of_current().unwrap(),
            EntryState::Fresh
        );
    }

    #[tokio::test]
    async fn test_params_change_without_auto_fetch_schedules_nothing() {
        let handles = echo_handles(FetcherConfig::default());
        handles.params.set(json!({"page": 3})).unwrap();
        handles.fetcher().wait_idle().await;
        assert_eq!(handles.data.current().unwrap(), None);
        assert_eq!(handles.fetcher().stats().fetches, 0);
    }
}
