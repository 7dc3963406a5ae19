//! keyfetch Core - Shared Types
//!
//! Pure data types used by every other keyfetch crate: cache keys and their
//! derivation, the error taxonomy, fetcher configuration, per-key status,
//! and the actions a fetch coordinator understands. No I/O and no locking.

pub mod action;
pub mod config;
pub mod error;
pub mod key;
pub mod status;
pub mod traits;

pub use action::{Action, DispatchOutcome, KeyPredicate, KeySelector};
pub use config::FetcherConfig;
pub use error::{ConfigError, FetchError, KeyError, KeyfetchError, KeyfetchResult, StoreError};
pub use key::{derive_key, derive_key_from_value, CacheKey};
pub use status::{CacheStats, EntryRead, EntryState, EntryStatus};
pub use traits::{FetchData, FetchParams};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
