//! keyfetch Test Utilities
//!
//! Shared test infrastructure for the keyfetch workspace:
//! - A scripted mock fetch source with a call log, failure injection and gates
//! - Proptest generators for parameter values
//! - Todo fixtures used by the integration tests and the demo
//! - Assertions on dispatch results

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

pub use keyfetch_core::{
    derive_key, Action, CacheKey, DispatchOutcome, FetchError, KeyfetchError, KeyfetchResult,
};
pub use keyfetch_store::FetchSource;

// ============================================================================
// SCRIPTED SOURCE
// ============================================================================

/// A pause point for one scripted call.
///
/// The call that picks up the gate reports that it has started, then waits
/// until [`Gate::open`] is called.
#[derive(Clone)]
pub struct Gate {
    open: watch::Sender<bool>,
    entered: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::Sender::new(false),
            entered: watch::Sender::new(false),
        }
    }

    /// Let the gated call return.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Wait until the gated call has reached the gate.
    pub async fn entered(&self) {
        let mut rx = self.entered.subscribe();
        let _ = rx.wait_for(|e| *e).await;
    }

    async fn pass(&self) {
        self.entered.send_replace(true);
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|o| *o).await;
    }
}

type Response<D> = Result<D, String>;

struct Script<D> {
    persistent: HashMap<CacheKey, Response<D>>,
    once: HashMap<CacheKey, VecDeque<Response<D>>>,
    gates: HashMap<CacheKey, VecDeque<Gate>>,
    calls: Vec<CacheKey>,
}

impl<D> Default for Script<D> {
    fn default() -> Self {
        Self {
            persistent: HashMap::new(),
            once: HashMap::new(),
            gates: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

/// Mock fetch source answering from a per-key script.
///
/// Responses are looked up by the cache key of the parameters a fetch is
/// called with. One-shot responses queued with [`respond_once`] and
/// [`fail_once`] win over the persistent response set with [`respond`].
/// A call with nothing scripted fails.
///
/// [`respond_once`]: ScriptedSource::respond_once
/// [`fail_once`]: ScriptedSource::fail_once
/// [`respond`]: ScriptedSource::respond
pub struct ScriptedSource<D> {
    script: Arc<Mutex<Script<D>>>,
}

impl<D> Clone for ScriptedSource<D> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<D> Default for ScriptedSource<D> {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
        }
    }
}

impl<D: Clone + Send + 'static> ScriptedSource<D> {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<P: Serialize>(params: &P) -> CacheKey {
        derive_key(params).expect("test params must serialize")
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script<D>> {
        self.script.lock().expect("script lock poisoned")
    }

    /// Answer every call for `params` with `data`.
    pub fn respond<P: Serialize>(&self, params: &P, data: D) -> &Self {
        self.script().persistent.insert(Self::key(params), Ok(data));
        self
    }

    /// Answer the next call for `params` with `data`.
    pub fn respond_once<P: Serialize>(&self, params: &P, data: D) -> &Self {
        self.script()
            .once
            .entry(Self::key(params))
            .or_default()
            .push_back(Ok(data));
        self
    }

    /// Fail the next call for `params`.
    pub fn fail_once<P: Serialize>(&self, params: &P, reason: impl Into<String>) -> &Self {
        self.script()
            .once
            .entry(Self::key(params))
            .or_default()
            .push_back(Err(reason.into()));
        self
    }

    /// Fail every call for `params` that has no one-shot response queued.
    pub fn fail<P: Serialize>(&self, params: &P, reason: impl Into<String>) -> &Self {
        self.script()
            .persistent
            .insert(Self::key(params), Err(reason.into()));
        self
    }

    /// Hold the next call for `params` until the returned gate opens.
    pub fn gate<P: Serialize>(&self, params: &P) -> Gate {
        let gate = Gate::new();
        self.script()
            .gates
            .entry(Self::key(params))
            .or_default()
            .push_back(gate.clone());
        gate
    }

    /// Keys of every call made so far, in call order.
    pub fn calls(&self) -> Vec<CacheKey> {
        self.script().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script().calls.len()
    }

    /// Number of calls made with `params`.
    pub fn calls_for<P: Serialize>(&self, params: &P) -> usize {
        let key = Self::key(params);
        self.script().calls.iter().filter(|k| **k == key).count()
    }

    /// Record the call and pick up its gate and response.
    ///
    /// The response is chosen when the call starts, so a later `respond`
    /// does not change what an already-gated call returns.
    fn begin(&self, key: &CacheKey) -> (Option<Gate>, Option<Response<D>>) {
        let mut script = self.script();
        script.calls.push(key.clone());
        let gate = script.gates.get_mut(key).and_then(VecDeque::pop_front);
        let response = script
            .once
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .or_else(|| script.persistent.get(key).cloned());
        (gate, response)
    }
}

#[async_trait]
impl<P, D> FetchSource<P, D> for ScriptedSource<D>
where
    P: Serialize + Send + 'static,
    D: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, params: P) -> Result<D, FetchError> {
        let key = Self::key(&params);
        let (gate, response) = self.begin(&key);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match response {
            Some(Ok(data)) => Ok(data),
            Some(Err(reason)) => Err(FetchError::source(reason)),
            None => Err(FetchError::source(format!("no scripted response for {key}"))),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for parameter values.

    use proptest::prelude::*;
    use serde_json::{Map, Number, Value};

    /// JSON scalars, without floats that have no JSON representation.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(n.into())),
            (-1.0e9f64..1.0e9f64)
                .prop_filter_map("finite", Number::from_f64)
                .prop_map(Value::Number),
            "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
        ]
    }

    /// Arbitrary JSON values up to a few levels deep.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::hash_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// Parameter objects: a map of field names to arbitrary values.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        prop::collection::hash_map("[a-zA-Z]{1,8}", arb_value(), 0..6)
            .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
    }

    /// Todo-style query parameters: `{}` or `{"userId": n}`.
    pub fn arb_todo_query() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(serde_json::json!({})),
            (1u64..10).prop_map(|id| serde_json::json!({ "userId": id })),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Todo fixtures matching the demo scenario.

    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Todo {
        pub id: u64,
        pub user_id: u64,
        pub title: String,
        pub completed: bool,
    }

    impl Todo {
        pub fn new(id: u64, user_id: u64, completed: bool) -> Self {
            Self {
                id,
                user_id,
                title: format!("todo {id}"),
                completed,
            }
        }
    }

    pub fn all_users() -> Value {
        json!({})
    }

    pub fn user(id: u64) -> Value {
        json!({ "userId": id })
    }

    /// What the source returns for `{}`.
    pub fn all_todos() -> Vec<Todo> {
        vec![Todo::new(1, 1, false)]
    }

    /// What the source returns for `{"userId": 2}`.
    pub fn user_two_todos() -> Vec<Todo> {
        vec![Todo::new(2, 2, true)]
    }

    /// A source scripted with both responses above.
    pub fn todo_source() -> super::ScriptedSource<Vec<Todo>> {
        let source = super::ScriptedSource::new();
        source.respond(&all_users(), all_todos());
        source.respond(&user(2), user_two_todos());
        source
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on dispatch results.

    use super::*;

    #[track_caller]
    pub fn assert_outcome(result: &KeyfetchResult<DispatchOutcome>, expected: DispatchOutcome) {
        match result {
            Ok(outcome) => assert_eq!(*outcome, expected),
            Err(e) => panic!("Expected {expected:?}, got Err: {e}"),
        }
    }

    /// Assert that a dispatch failed with a recoverable fetch error.
    #[track_caller]
    pub fn assert_fetch_failed<T: std::fmt::Debug>(result: &KeyfetchResult<T>) {
        match result {
            Err(KeyfetchError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }
}
