//! Concurrency and Property Tests for the Fetch Coordinator
//!
//! - Concurrent dispatches for one key share a single source call
//! - Followers of a dropped leader fail instead of hanging
//! - A result whose key was invalidated mid-flight is never committed
//! - Any sequence of parameter switches calls the source once per distinct key

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keyfetch_store::{
    derive_key, from_fn, Action, DispatchOutcome, EntryState, FetchError, Fetcher, FetcherConfig,
    FetcherOptions, KeySelector, KeyfetchError,
};
use keyfetch_test_utils::fixtures::{all_todos, all_users, todo_source, user_two_todos, Todo};
use keyfetch_test_utils::generators::{arb_params, arb_todo_query};
use keyfetch_test_utils::ScriptedSource;
use proptest::prelude::*;
use serde_json::Value;

// ============================================================================
// IN-FLIGHT DEDUPLICATION
// ============================================================================

async fn concurrent_fetches(config: FetcherConfig, n: usize) -> (Vec<DispatchOutcome>, usize) {
    let source = todo_source();
    let fetcher = Fetcher::new(
        source.clone(),
        FetcherOptions::new(all_users(), Vec::<Todo>::new()).with_config(config),
    )
    .unwrap();
    let gates: Vec<_> = (0..n).map(|_| source.gate(&all_users())).collect();

    let tasks: Vec<_> = (0..n)
        .map(|_| {
            let f = fetcher.clone();
            tokio::spawn(async move { f.dispatch(Action::FetchData).await })
        })
        .collect();

    // Wait until every dispatch has either reached the source or joined.
    while source.call_count() + (fetcher.stats().joined as usize) < n {
        tokio::task::yield_now().await;
    }
    for gate in &gates {
        gate.open();
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }
    assert_eq!(fetcher.current().unwrap(), Some(all_todos()));
    (outcomes, source.call_count())
}

#[tokio::test]
async fn test_concurrent_dispatches_share_one_fetch() {
    let (outcomes, calls) = concurrent_fetches(FetcherConfig::default(), 3).await;
    assert_eq!(calls, 1);
    assert_eq!(
        outcomes.iter().filter(|o| **o == DispatchOutcome::Fetched).count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == DispatchOutcome::Joined).count(),
        2
    );
}

#[tokio::test]
async fn test_dedupe_disabled_calls_source_per_dispatch() {
    let (outcomes, calls) =
        concurrent_fetches(FetcherConfig::new().with_dedupe_in_flight(false), 3).await;
    assert_eq!(calls, 3);
    assert!(outcomes.iter().all(|o| *o == DispatchOutcome::Fetched));
}

#[tokio::test]
async fn test_joined_dispatch_sees_leader_failure() {
    let source: ScriptedSource<Vec<Todo>> = ScriptedSource::new();
    source.fail_once(&all_users(), "connection reset");
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(source.clone(), FetcherOptions::new(all_users(), Vec::new())).unwrap();

    let leader = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    gate.entered().await;
    let follower = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    while fetcher.stats().joined < 1 {
        tokio::task::yield_now().await;
    }
    gate.open();

    assert!(matches!(leader.await.unwrap(), Err(KeyfetchError::Fetch(_))));
    assert!(matches!(follower.await.unwrap(), Err(KeyfetchError::Fetch(_))));
    assert_eq!(source.call_count(), 1);
    assert_eq!(fetcher.current().unwrap(), Some(Vec::new()));
}

#[tokio::test]
async fn test_follower_of_dropped_leader_is_abandoned() {
    let source = todo_source();
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(source.clone(), FetcherOptions::new(all_users(), Vec::new())).unwrap();

    let leader = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    gate.entered().await;
    let follower = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    while fetcher.stats().joined < 1 {
        tokio::task::yield_now().await;
    }

    leader.abort();
    assert!(leader.await.unwrap_err().is_cancelled());
    assert!(matches!(
        follower.await.unwrap(),
        Err(KeyfetchError::Fetch(FetchError::Abandoned { .. }))
    ));
    assert!(!fetcher.is_in_flight(&derive_key(&all_users()).unwrap()));

    // The dropped flight leaves nothing behind, so the next dispatch leads.
    assert_eq!(
        fetcher.dispatch(Action::FetchData).await.unwrap(),
        DispatchOutcome::Fetched
    );
    assert_eq!(fetcher.current().unwrap(), Some(all_todos()));
    assert_eq!(source.call_count(), 2);
}

// ============================================================================
// SUPERSEDED RESULTS
// ============================================================================

#[tokio::test]
async fn test_result_invalidated_mid_flight_is_dropped() {
    let source: ScriptedSource<Vec<Todo>> = ScriptedSource::new();
    source
        .respond_once(&all_users(), all_todos())
        .respond(&all_users(), user_two_todos());
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(source.clone(), FetcherOptions::new(all_users(), Vec::new())).unwrap();

    let slow = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    gate.entered().await;

    fetcher.dispatch(Action::invalidate()).await.unwrap();
    // The invalidated fetch is not joinable, so this one calls the source.
    assert_eq!(
        fetcher.dispatch(Action::FetchData).await.unwrap(),
        DispatchOutcome::Fetched
    );
    assert_eq!(fetcher.current().unwrap(), Some(user_two_todos()));

    gate.open();
    assert_eq!(slow.await.unwrap().unwrap(), DispatchOutcome::Superseded);
    assert_eq!(fetcher.current().unwrap(), Some(user_two_todos()));
    assert_eq!(fetcher.state_of_current().unwrap(), EntryState::Fresh);
    assert_eq!(fetcher.stats().superseded, 1);
    assert_eq!(source.call_count(), 2);
}

#[tokio::test]
async fn test_result_after_reset_is_dropped() {
    let source = todo_source();
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(source.clone(), FetcherOptions::new(all_users(), Vec::new())).unwrap();

    let slow = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    gate.entered().await;
    fetcher.dispatch(Action::ResetCache).await.unwrap();
    gate.open();

    assert_eq!(slow.await.unwrap().unwrap(), DispatchOutcome::Superseded);
    assert_eq!(fetcher.current().unwrap(), Some(Vec::new()));
    assert_eq!(fetcher.state_of_current().unwrap(), EntryState::Stale);
}

#[tokio::test]
async fn test_superseded_result_committed_when_dropping_disabled() {
    let source = todo_source();
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(
        source.clone(),
        FetcherOptions::new(all_users(), Vec::new())
            .with_config(FetcherConfig::new().with_drop_superseded(false)),
    )
    .unwrap();

    let slow = {
        let f = fetcher.clone();
        tokio::spawn(async move { f.dispatch(Action::FetchData).await })
    };
    gate.entered().await;
    fetcher
        .dispatch(Action::Evict(KeySelector::All))
        .await
        .unwrap();
    gate.open();

    assert_eq!(slow.await.unwrap().unwrap(), DispatchOutcome::Fetched);
    assert_eq!(fetcher.current().unwrap(), Some(all_todos()));
}

#[tokio::test]
async fn test_wait_idle_covers_in_flight_fetches() {
    let source = todo_source();
    let gate = source.gate(&all_users());
    let fetcher = Fetcher::new(source.clone(), FetcherOptions::new(all_users(), Vec::new())).unwrap();

    let f = fetcher.clone();
    let task = tokio::spawn(async move { f.dispatch(Action::FetchData).await });
    gate.entered().await;
    assert!(fetcher.is_in_flight(&derive_key(&all_users()).unwrap()));

    let opener = tokio::spawn(async move {
        tokio::task::yield_now().await;
        gate.open();
    });
    fetcher.wait_idle().await;
    assert!(!fetcher.is_in_flight(&derive_key(&all_users()).unwrap()));
    assert_eq!(fetcher.current().unwrap(), Some(all_todos()));
    opener.await.unwrap();
    task.await.unwrap().unwrap();
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn echo_fetcher(calls: Arc<AtomicUsize>) -> Fetcher<Value, Value> {
    let source = from_fn(move |params: Value| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, String>(params) }
    });
    Fetcher::new(
        source,
        FetcherOptions::new(all_users(), Value::Null)
            .with_config(FetcherConfig::new().with_initial_stale(false)),
    )
    .unwrap()
}

proptest! {
    /// Whatever order parameters are visited in, each distinct key is
    /// fetched once and the entry under it is what the source returned.
    #[test]
    fn prop_one_fetch_per_distinct_key(
        queries in prop::collection::vec(arb_todo_query(), 1..20)
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = echo_fetcher(Arc::clone(&calls));
        let rt = runtime();

        for query in &queries {
            fetcher.set_params(query.clone()).unwrap();
            let data = rt.block_on(fetcher.ensure_loaded()).unwrap();
            if *query != all_users() {
                prop_assert_eq!(data, Some(query.clone()));
            }
        }

        let distinct: HashSet<_> = queries
            .iter()
            .filter(|q| **q != all_users())
            .map(|q| derive_key(q).unwrap())
            .collect();
        prop_assert_eq!(calls.load(Ordering::SeqCst), distinct.len());
    }

    /// Params that serialize always yield a usable fetcher key, and peeking
    /// at them never fails.
    #[test]
    fn prop_arbitrary_params_are_peekable(params in arb_params()) {
        let fetcher = echo_fetcher(Arc::new(AtomicUsize::new(0)));
        prop_assert!(fetcher.set_params(params.clone()).is_ok());
        prop_assert_eq!(fetcher.cache_key().unwrap(), derive_key(&params).unwrap());
        let expected = if params == all_users() { Some(Value::Null) } else { None };
        prop_assert_eq!(fetcher.peek(&params), expected);
    }
}
