//! Fuzz test for cache key derivation
//!
//! Feeds arbitrary JSON documents through the key deriver and checks that:
//! - Derivation never panics
//! - A derived key parses back into a value that derives the same key
//! - Reordering object fields never changes the key
//!
//! Run with: cargo +nightly fuzz run key_deriver_fuzz -- -max_total_time=60

#![no_main]

use keyfetch_core::derive_key_from_value;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

/// Rebuild every object with its fields in reverse insertion order.
fn reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .rev()
                .map(|(k, v)| (k.clone(), reversed(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        other => other.clone(),
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let Ok(key) = derive_key_from_value(&value) else {
        return;
    };

    let parsed = key.to_value().expect("derived key must be valid JSON");
    let again = derive_key_from_value(&parsed).expect("parsed key must derive");
    assert_eq!(key, again, "key derivation is not a fixed point");

    let shuffled = derive_key_from_value(&reversed(&value)).expect("reordered value must derive");
    assert_eq!(key, shuffled, "field order changed the key");
});
