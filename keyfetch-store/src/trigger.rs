//! Auto-fetch trigger.
//!
//! Remembers the last observed `(key, stale, generation)` signature and
//! reports when an observation differs from it. Each change results in at
//! most one scheduled `FetchData`; observing the same signature again
//! schedules nothing.

use std::sync::Mutex;

use keyfetch_core::{CacheKey, EntryStatus, KeyfetchResult, StoreError};

/// What the trigger compares between observations.
///
/// The generation is part of the signature so that re-invalidating a key
/// that is already stale still counts as a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSignature {
    pub key: CacheKey,
    pub stale: bool,
    pub generation: u64,
}

impl TriggerSignature {
    pub fn new(key: CacheKey, status: &EntryStatus) -> Self {
        Self {
            key,
            stale: status.state.needs_fetch(),
            generation: status.generation,
        }
    }
}

#[derive(Default)]
pub struct AutoFetch {
    last: Mutex<Option<TriggerSignature>>,
}

impl AutoFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation.
    ///
    /// Returns `true` when the signature changed and needs a fetch, i.e. the
    /// caller should schedule exactly one `FetchData`.
    pub fn observe(&self, signature: TriggerSignature) -> KeyfetchResult<bool> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "trigger" })?;
        if last.as_ref() == Some(&signature) {
            return Ok(false);
        }
        let needs_fetch = signature.stale;
        *last = Some(signature);
        Ok(needs_fetch)
    }

    /// Forget the last observation, so the next one always counts as a change.
    pub fn forget(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }

    pub fn last(&self) -> Option<TriggerSignature> {
        self.last.lock().ok().and_then(|l| l.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfetch_core::{derive_key, EntryState};
    use serde_json::json;

    fn signature(params: serde_json::Value, state: EntryState, generation: u64) -> TriggerSignature {
        TriggerSignature::new(
            derive_key(&params).unwrap(),
            &EntryStatus {
                state,
                last_updated: None,
                generation,
            },
        )
    }

    #[test]
    fn test_first_stale_observation_fires() {
        let trigger = AutoFetch::new();
        assert!(trigger
            .observe(signature(json!({}), EntryState::Stale, 0))
            .unwrap());
    }

    #[test]
    fn test_repeated_observation_fires_once() {
        let trigger = AutoFetch::new();
        let sig = signature(json!({}), EntryState::Missing, 0);
        assert!(trigger.observe(sig.clone()).unwrap());
        assert!(!trigger.observe(sig.clone()).unwrap());
        assert!(!trigger.observe(sig).unwrap());
    }

    #[test]
    fn test_fresh_change_does_not_fire() {
        let trigger = AutoFetch::new();
        assert!(!trigger
            .observe(signature(json!({}), EntryState::Fresh, 0))
            .unwrap());
        assert_eq!(trigger.last().unwrap().key.as_str(), "{}");
    }

    #[test]
    fn test_key_change_fires() {
        let trigger = AutoFetch::new();
        trigger
            .observe(signature(json!({}), EntryState::Fresh, 0))
            .unwrap();
        assert!(trigger
            .observe(signature(json!({"userId": 2}), EntryState::Missing, 0))
            .unwrap());
    }

    #[test]
    fn test_reinvalidation_fires_again() {
        let trigger = AutoFetch::new();
        assert!(trigger
            .observe(signature(json!({}), EntryState::Stale, 1))
            .unwrap());
        assert!(trigger
            .observe(signature(json!({}), EntryState::Stale, 2))
            .unwrap());
    }

    #[test]
    fn test_forget() {
        let trigger = AutoFetch::new();
        let sig = signature(json!({}), EntryState::Stale, 0);
        trigger.observe(sig.clone()).unwrap();
        trigger.forget();
        assert!(trigger.last().is_none());
        assert!(trigger.observe(sig).unwrap());
    }
}
