//! Canonical cache keys for (template, variables) pairs.
//!
//! A key is the compact JSON text of `[template, variables]` with every
//! object's keys written in sorted order, at every nesting level. Two
//! variable bags built in different insertion orders therefore produce the
//! same key, whatever map ordering `serde_json` was compiled with.
//!
//! Array order is significant: `[1, 2]` and `[2, 1]` are different values.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Number of hex characters in [`CacheKey::digest`].
const DIGEST_LEN: usize = 12;

/// Canonical identity of one logical backend subscription.
///
/// Cheap to clone; the canonical text is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    canonical: Arc<str>,
}

impl CacheKey {
    /// Build the key for a template and its (already merged) variables.
    pub fn build(template: &str, variables: &Map<String, Value>) -> Self {
        let mut canonical = String::with_capacity(template.len() + 16);
        canonical.push('[');
        write_string(&mut canonical, template);
        canonical.push(',');
        write_object(&mut canonical, variables);
        canonical.push(']');
        Self {
            canonical: canonical.into(),
        }
    }

    /// The canonical text this key compares by.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Short SHA-256 prefix, for log fields.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.canonical.as_bytes());
        let mut digest = hex::encode(hash);
        digest.truncate(DIGEST_LEN);
        digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Free-function form of [`CacheKey::build`].
pub fn build_key(template: &str, variables: &Map<String, Value>) -> CacheKey {
    CacheKey::build(template, variables)
}

/// True when `text` contains template syntax and must be rendered remotely.
///
/// Anything else is a literal and is used as-is without a subscription.
pub fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => write_object(out, map),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::String(text) => write_string(out, text),
        // null, bool and numbers have a single compact rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (index, (name, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(out, name);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_string(out: &mut String, text: &str) {
    // Display on a JSON string value yields the quoted, escaped form.
    out.push_str(&Value::String(text.to_owned()).to_string());
}
