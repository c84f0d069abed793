//! Deep merge of JSON payload layers
//!
//! Objects merge key by key, recursively. Everything else (scalars, arrays,
//! `null`) replaces whatever was underneath. A value equal to [`unset()`]
//! means "no opinion": the lower layer shows through, or the key stays absent
//! when nothing lower defines it. Sentinels never survive into a result.

use serde_json::{Map, Value};

const UNSET_KEY: &str = "$unset";

/// The "no opinion" sentinel, `{"$unset": true}`
pub fn unset() -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(UNSET_KEY.to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Whether a value is the unset sentinel
pub fn is_unset(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(UNSET_KEY) == Some(&Value::Bool(true)),
        _ => false,
    }
}

/// Merge `overlay` onto `base` in place
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if is_unset(overlay) {
        return;
    }

    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if is_unset(value) {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), strip_unset(value));
                    }
                }
            }
        }
        (slot, value) => *slot = strip_unset(value),
    }
}

/// Fold layers oldest first into a fresh value
///
/// No layers (or only sentinels) yields an empty object.
pub fn merge_layers<'a, I>(layers: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut merged: Option<Value> = None;

    for layer in layers {
        if is_unset(layer) {
            continue;
        }
        match merged.as_mut() {
            Some(acc) => deep_merge(acc, layer),
            None => merged = Some(strip_unset(layer)),
        }
    }

    merged.unwrap_or_else(|| Value::Object(Map::new()))
}

/// Clone a value with every sentinel removed
pub fn strip_unset(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !is_unset(v))
                .map(|(k, v)| (k.clone(), strip_unset(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| !is_unset(v))
                .map(strip_unset)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whether a value contains a sentinel anywhere
pub fn contains_unset(value: &Value) -> bool {
    match value {
        _ if is_unset(value) => true,
        Value::Object(map) => map.values().any(contains_unset),
        Value::Array(items) => items.iter().any(contains_unset),
        _ => false,
    }
}
