//! Canonical JSON for hashing and signing.
//!
//! Canonical form: object keys sorted lexicographically at every depth, no
//! insignificant whitespace, UTF-8, no trailing newline. Signer and verifier
//! must produce byte-identical output for semantically equal documents.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Rebuild a JSON value with every object's keys in sorted order.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), normalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Canonical serialization of any serde-serializable document.
pub fn canonical_json<T: Serialize>(doc: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(doc)?;
    serde_json::to_string(&normalize(&value))
}

/// Canonical bytes, the exact input to content hashing and signing.
pub fn canonical_bytes<T: Serialize>(doc: &T) -> serde_json::Result<Vec<u8>> {
    canonical_json(doc).map(String::into_bytes)
}
