//! Deterministic cache key derivation.
//!
//! A [`CacheKey`] is the canonical JSON rendering of a parameter value.
//! Object members are always emitted in sorted key order, so two parameter
//! values that are structurally equal produce byte-identical keys no matter
//! how their fields were declared or inserted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

use crate::error::KeyError;

mod finite;

/// Number of digest bytes kept by [`CacheKey::fingerprint`].
const FINGERPRINT_BYTES: usize = 8;

/// Address of one cache entry.
///
/// The only ways to obtain a key are [`derive_key`] and
/// [`derive_key_from_value`], so every key in a store is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// The canonical serialization this key wraps.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, fixed-width hex digest of the key.
    ///
    /// Keys can be arbitrarily long; log fields use this instead.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }

    /// Parse the key back into the JSON value it was derived from.
    pub fn to_value(&self) -> Result<Value, KeyError> {
        serde_json::from_str(&self.0).map_err(|e| KeyError::Serialization {
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Derive the cache key for a parameter value.
///
/// Fails when `params` cannot be represented as JSON: a map with non-string
/// keys, or a NaN or infinite float anywhere in the value.
pub fn derive_key<P: Serialize + ?Sized>(params: &P) -> Result<CacheKey, KeyError> {
    finite::check(params).map_err(|e| KeyError::Serialization {
        reason: e.to_string(),
    })?;
    let value = serde_json::to_value(params).map_err(|e| KeyError::Serialization {
        reason: e.to_string(),
    })?;
    derive_key_from_value(&value)
}

/// Derive the cache key for an already-built JSON value.
pub fn derive_key_from_value(value: &Value) -> Result<CacheKey, KeyError> {
    let canonical = canonicalize(value);
    serde_json::to_string(&canonical)
        .map(CacheKey)
        .map_err(|e| KeyError::Serialization {
            reason: e.to_string(),
        })
}

/// Rebuild `value` with every object's members inserted in sorted order and
/// `-0.0` folded into `0.0`, which compares equal to it.
///
/// The default `serde_json::Map` is already ordered, but a dependency that
/// turns on `preserve_order` switches it to insertion order workspace-wide.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f == 0.0 && f.is_sign_negative()) => {
            Value::from(0.0)
        }
        other => other.clone(),
    }
}
