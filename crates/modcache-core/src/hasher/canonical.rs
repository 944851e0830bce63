//! Canonical JSON for build settings.
//!
//! Object keys are sorted recursively by UTF-16 code units, integer-valued
//! floats are rewritten as integers and non-finite numbers are rejected, so
//! semantically equal settings always serialise to the same bytes.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("non-finite number at `{0}`")]
    NonFinite(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn sort_keys_utf16(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys_utf16(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys_utf16).collect()),
        other => other,
    }
}

fn normalize(value: &Value, path: &str) -> Result<Value, CanonicalError> {
    match value {
        Value::Object(map) => {
            let mut normalized = Map::new();
            for (key, item) in map {
                normalized.insert(key.clone(), normalize(item, &format!("{path}.{key}"))?);
            }
            Ok(Value::Object(normalized))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize(item, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(CanonicalError::NonFinite(path.to_string())),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(Value::Number(Number::from(f as i64)))
            }
            _ => Ok(value.clone()),
        },
        other => Ok(other.clone()),
    }
}

/// Canonical form of an arbitrary JSON value.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalError> {
    let normalized = normalize(value, "$")?;
    Ok(serde_json::to_string(&sort_keys_utf16(normalized))?)
}

/// Canonical form of a node's settings map.
pub fn canonical_settings(settings: &BTreeMap<String, Value>) -> Result<String, CanonicalError> {
    let object: Map<String, Value> = settings
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    canonical_json(&Value::Object(object))
}
