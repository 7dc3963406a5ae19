//! Todos demo.
//!
//! Fronts a simulated todo service with a fetcher, switches between the
//! "all users" and "user 2" queries, and shows which reads hit the cache.
//!
//! Run with `RUST_LOG=keyfetch_store=debug` to see fetch decisions.

use std::time::Duration;

use async_trait::async_trait;
use keyfetch_store::{
    create_fetcher, Action, FetchError, FetchSource, FetcherConfig, FetcherOptions, KeyfetchResult,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Todo {
    id: u64,
    user_id: u64,
    title: String,
    completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodoQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<u64>,
}

/// Stand-in for a remote todo service.
struct TodoService {
    latency: Duration,
}

#[async_trait]
impl FetchSource<TodoQuery, Vec<Todo>> for TodoService {
    async fn fetch(&self, query: TodoQuery) -> Result<Vec<Todo>, FetchError> {
        tokio::time::sleep(self.latency).await;
        let todos = (1..=6u64).map(|id| Todo {
            id,
            user_id: (id + 1) / 2,
            title: format!("todo #{id}"),
            completed: id % 3 == 0,
        });
        Ok(match query.user_id {
            Some(user) => todos.filter(|t| t.user_id == user).collect(),
            None => todos.collect(),
        })
    }
}

#[tokio::main]
async fn main() -> KeyfetchResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keyfetch_store=debug,info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let handles = create_fetcher(
        TodoService {
            latency: Duration::from_millis(50),
        },
        FetcherOptions::new(TodoQuery::default(), Vec::new())
            .with_config(FetcherConfig::from_env().with_auto_fetch(true)),
    )?;
    let fetcher = handles.fetcher().clone();

    let completed = fetcher.derive_current(|todos: &Vec<Todo>| {
        todos.iter().filter(|t| t.completed).count()
    });

    let all = handles.data.ensure_loaded().await?.unwrap_or_default();
    tracing::info!(count = all.len(), completed = completed.get()?, "All users loaded");

    handles.params.set(TodoQuery { user_id: Some(2) })?;
    tracing::info!(
        cached = ?handles.data.current()?,
        "Switched to user 2, fetch scheduled"
    );
    fetcher.wait_idle().await;
    tracing::info!(
        todos = ?handles.data.current()?,
        completed = completed.get()?,
        "User 2 loaded"
    );

    handles.params.set(TodoQuery::default())?;
    tracing::info!(
        count = handles.data.current()?.map(|t| t.len()).unwrap_or(0),
        "Back to all users, served from cache"
    );

    handles.dispatch.dispatch(Action::invalidate()).await?;
    let read = fetcher.current_read()?;
    tracing::info!(
        stale = read.as_ref().map(|r| r.is_stale()).unwrap_or(false),
        "Invalidated, still serving the previous data"
    );
    handles.data.ensure_loaded().await?;

    handles.dispatch.dispatch(Action::ResetCache).await?;
    let stats = fetcher.stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        fetches = stats.fetches,
        hit_rate = stats.hit_rate(),
        recomputes = completed.recompute_count(),
        "Done"
    );
    Ok(())
}
