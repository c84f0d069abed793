//! JSON to CEL values for rule evaluation

use cel_interpreter::objects::{Key, Map, Value as CelValue};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Convert a JSON value into the CEL value rule bodies see
///
/// Integers stay integers (signed when they fit), other numbers become
/// doubles. Objects become string-keyed maps.
pub fn json_to_cel(value: &JsonValue) -> CelValue {
    match value {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else {
                n.as_f64().map(CelValue::Float).unwrap_or(CelValue::Null)
            }
        }
        JsonValue::String(s) => CelValue::String(Arc::new(s.clone())),
        JsonValue::Array(items) => {
            let items: Vec<CelValue> = items.iter().map(json_to_cel).collect();
            CelValue::List(Arc::new(items))
        }
        JsonValue::Object(object) => {
            let entries: HashMap<Key, CelValue> = object
                .iter()
                .map(|(k, v)| (Key::String(Arc::new(k.clone())), json_to_cel(v)))
                .collect();
            CelValue::Map(Map {
                map: Arc::new(entries),
            })
        }
    }
}

/// Convert a rule's argument list
pub fn args_to_cel(args: &[JsonValue]) -> CelValue {
    CelValue::List(Arc::new(args.iter().map(json_to_cel).collect()))
}
