//! The fetch source boundary.
//!
//! The transport that actually produces data is external. The fetcher only
//! needs an asynchronous `params -> data` call that may fail.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use keyfetch_core::FetchError;

/// Asynchronous data source fronted by a fetcher.
///
/// Implementations receive an owned snapshot of the parameters that were
/// current when the fetch was triggered. A returned error never touches
/// cache state.
#[async_trait]
pub trait FetchSource<P, D>: Send + Sync {
    /// Fetch the data for `params`.
    async fn fetch(&self, params: P) -> Result<D, FetchError>;
}

/// Adapter turning an async closure into a [`FetchSource`].
pub struct FnSource<F> {
    f: F,
}

/// Wrap an async closure as a fetch source.
///
/// Any error type that implements `Display` is accepted and reported as
/// [`FetchError::Source`].
///
/// ```ignore
/// let source = from_fn(|params: TodoQuery| async move {
///     client.todos(params.user_id).await
/// });
/// ```
pub fn from_fn<F>(f: F) -> FnSource<F> {
    FnSource { f }
}

#[async_trait]
impl<P, D, E, F, Fut> FetchSource<P, D> for FnSource<F>
where
    P: Send + 'static,
    D: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<D, E>> + Send + 'static,
{
    async fn fetch(&self, params: P) -> Result<D, FetchError> {
        (self.f)(params).await.map_err(FetchError::source)
    }
}
