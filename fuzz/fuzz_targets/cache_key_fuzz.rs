//! Fuzz test for cache key canonicalization
//!
//! Any JSON object used as variables must produce a key that is itself
//! valid JSON, and rebuilding from the reversed insertion order must give
//! the same key.
//!
//! Run with: cargo +nightly fuzz run cache_key_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value};
use templink_core::CacheKey;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (template, rest) = input.split_once('\n').unwrap_or((input, "{}"));
    let Ok(Value::Object(variables)) = serde_json::from_str::<Value>(rest) else {
        return;
    };

    let key = CacheKey::build(template, &variables);
    assert!(
        serde_json::from_str::<Value>(key.as_str()).is_ok(),
        "canonical key must be valid JSON"
    );

    let reversed: Map<String, Value> = variables
        .iter()
        .rev()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(key, CacheKey::build(template, &reversed));
});
