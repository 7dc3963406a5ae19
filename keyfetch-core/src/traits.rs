//! Marker traits for parameter and data types.

use serde::Serialize;

/// Marker trait for types usable as fetch parameters.
///
/// Parameters must serialize deterministically into a cache key, and must be
/// `Clone + Send + Sync + 'static` so a snapshot can travel into a fetch.
pub trait FetchParams: Serialize + Clone + Send + Sync + 'static {}

impl<T> FetchParams for T where T: Serialize + Clone + Send + Sync + 'static {}

/// Marker trait for types usable as cached data.
///
/// Readers receive clones; commits never mutate a value in place.
pub trait FetchData: Clone + Send + Sync + 'static {}

impl<T> FetchData for T where T: Clone + Send + Sync + 'static {}
