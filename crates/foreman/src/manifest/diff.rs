//! Structural diff between two JSON-like values.
//!
//! The result mirrors the shape of the inputs but only keeps changed paths:
//! added or changed leaves carry the new value, removed keys map to `null`.
//! Arrays are compared index by index and reported as objects keyed by index.

use serde_json::{Map, Value};

use super::item::ManifestItem;
use crate::error::Result;

/// Returns the changed paths from `old` to `new`, or `None` when equal.
pub fn diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = Map::new();
            for (key, old_value) in a {
                match b.get(key) {
                    Some(new_value) => {
                        if let Some(changed) = diff(old_value, new_value) {
                            out.insert(key.clone(), changed);
                        }
                    }
                    None => {
                        out.insert(key.clone(), Value::Null);
                    }
                }
            }
            for (key, new_value) in b {
                if !a.contains_key(key) {
                    out.insert(key.clone(), new_value.clone());
                }
            }
            non_empty(out)
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut out = Map::new();
            for index in 0..a.len().max(b.len()) {
                match (a.get(index), b.get(index)) {
                    (Some(old_value), Some(new_value)) => {
                        if let Some(changed) = diff(old_value, new_value) {
                            out.insert(index.to_string(), changed);
                        }
                    }
                    (Some(_), None) => {
                        out.insert(index.to_string(), Value::Null);
                    }
                    (None, Some(new_value)) => {
                        out.insert(index.to_string(), new_value.clone());
                    }
                    (None, None) => {}
                }
            }
            non_empty(out)
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

fn non_empty(map: Map<String, Value>) -> Option<Value> {
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// Diffs two manifest items as whole documents.
pub fn diff_items(old: &ManifestItem, new: &ManifestItem) -> Result<Option<Value>> {
    Ok(diff(&serde_json::to_value(old)?, &serde_json::to_value(new)?))
}

/// Keys of the object at `pointer` inside a diff (empty if absent).
pub fn changed_keys<'a>(diff: &'a Value, pointer: &str) -> Vec<&'a str> {
    diff.pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| map.keys().map(String::as_str).collect())
        .unwrap_or_default()
}
