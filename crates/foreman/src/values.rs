//! Chart values: deep merge and `key.path=value` overrides.

use serde_json::{Map, Value};

use crate::error::{ForemanError, Result};

/// Deep-merges `overlay` into `base`. Objects merge key by key; scalars and
/// arrays in `overlay` replace what `base` had.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Returns `base` merged with `overlay`.
pub fn merged(mut base: Value, overlay: Value) -> Value {
    merge(&mut base, overlay);
    base
}

/// Splits a `key.path=value` override.
pub fn parse_override(pair: &str) -> Result<(Vec<String>, String)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| ForemanError::InvalidSpec(format!("invalid --set '{}': expected key=value", pair)))?;
    if key.is_empty() || value.is_empty() {
        return Err(ForemanError::InvalidSpec(format!(
            "invalid --set '{}': key and value must not be empty",
            pair
        )));
    }
    let path: Vec<String> = key.split('.').map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(ForemanError::InvalidSpec(format!(
            "invalid --set '{}': empty path segment",
            pair
        )));
    }
    Ok((path, value.to_string()))
}

fn index_of(segment: &str) -> Option<usize> {
    segment.parse().ok()
}

fn set_path(target: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        *target = value;
        return Ok(());
    };

    if let (Value::Array(items), Some(idx)) = (&mut *target, index_of(head)) {
        if idx >= items.len() {
            items.resize(idx + 1, Value::Null);
        }
        return set_path(&mut items[idx], rest, value);
    }

    if target.is_null() {
        *target = match index_of(head) {
            Some(_) => Value::Array(Vec::new()),
            None => Value::Object(Map::new()),
        };
        return set_path(target, path, value);
    }

    match target {
        Value::Object(map) => {
            let child = map.entry(head.clone()).or_insert(Value::Null);
            set_path(child, rest, value)
        }
        _ => Err(ForemanError::InvalidSpec(format!(
            "cannot set '{}' inside a non-object value",
            head
        ))),
    }
}

/// Applies `key.path=value` pairs to `app`. Numeric segments index into
/// arrays; values are set as strings.
pub fn apply_set_overrides<S: AsRef<str>>(app: &mut Value, pairs: &[S]) -> Result<()> {
    for pair in pairs {
        let (path, value) = parse_override(pair.as_ref())?;
        set_path(app, &path, Value::String(value))?;
    }
    Ok(())
}
