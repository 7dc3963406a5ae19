//! keyfetch Store - Reactive Fetch Cache
//!
//! Caches the results of an asynchronous fetch source, keyed by the
//! parameters that produced them. Switching parameters switches the visible
//! entry; switching back to parameters seen before serves the cached data
//! without calling the source again.
//!
//! The pieces:
//! - [`ParamStore`], [`CacheStore`] and [`StatusTable`]: the versioned stores
//! - [`DerivedView`]: memoized, pull-based views over any [`VersionSource`]
//! - [`FetchCoordinator`]: the per-key state machine and in-flight dedup
//! - [`AutoFetch`]: schedules fetches when the current key needs one
//! - [`Fetcher`] and [`create_fetcher`]: the consumer-facing bundle

pub mod cache;
pub mod coordinator;
pub mod derived;
pub mod fetcher;
pub mod params;
pub mod source;
pub mod status;
pub mod trigger;

pub use cache::{CacheSnapshot, CacheStore};
pub use coordinator::FetchCoordinator;
pub use derived::{DerivedView, VersionSource};
pub use fetcher::{
    create_fetcher, CacheKeyHandle, CurrentEntryHandle, DataHandle, DispatchHandle, Fetcher,
    FetcherHandles, FetcherOptions, ParamsHandle,
};
pub use params::ParamStore;
pub use source::{from_fn, FetchSource, FnSource};
pub use status::StatusTable;
pub use trigger::{AutoFetch, TriggerSignature};

// Re-export the core types consumers need alongside the store.
pub use keyfetch_core::{
    derive_key, Action, CacheKey, CacheStats, DispatchOutcome, EntryRead, EntryState, EntryStatus,
    FetchError, FetcherConfig, KeySelector, KeyfetchError, KeyfetchResult,
};
