//! Value coercion shared by the filter compiler, the query builder and record snapshots.
//!
//! Everything bound to a statement passes through [`coerce`] so the driver never sees a
//! boolean: `false` binds as `0`, `true` as `1`.

use crate::error::{KeelError, Result};
use serde_json::Value;

/// Normalize a value for binding or snapshot comparison
pub fn coerce(value: Value) -> Value {
    match value {
        Value::Bool(b) => Value::from(i64::from(b)),
        other => other,
    }
}

/// Borrowing variant of [`coerce`]
pub fn coerce_ref(value: &Value) -> Value {
    coerce(value.clone())
}

/// Scalar values are the only ones that can be bound as a single parameter
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Read an integer column value, accepting numeric strings (DECIMAL, BIGINT UNSIGNED)
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Read a floating point column value
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Render a value as a map key (used by keyed plucks)
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Setter helpers used by record descriptors.
///
/// Each returns `Ok(None)` for SQL NULL and an `InvalidInput` error when the column value
/// has the wrong shape for the target field.
pub mod decode {
    use super::*;

    pub fn int(field: &str, value: Value) -> Result<Option<i64>> {
        match value {
            Value::Null => Ok(None),
            other => as_i64(&other).map(Some).ok_or_else(|| {
                KeelError::InvalidInput(format!("field `{field}` expects an integer, got {other}"))
            }),
        }
    }

    pub fn float(field: &str, value: Value) -> Result<Option<f64>> {
        match value {
            Value::Null => Ok(None),
            other => as_f64(&other).map(Some).ok_or_else(|| {
                KeelError::InvalidInput(format!("field `{field}` expects a number, got {other}"))
            }),
        }
    }

    pub fn text(field: &str, value: Value) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Number(n) => Ok(Some(n.to_string())),
            other => Err(KeelError::InvalidInput(format!(
                "field `{field}` expects text, got {other}"
            ))),
        }
    }

    pub fn boolean(field: &str, value: Value) -> Result<Option<bool>> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            other => as_i64(&other).map(|i| Some(i != 0)).ok_or_else(|| {
                KeelError::InvalidInput(format!("field `{field}` expects a boolean, got {other}"))
            }),
        }
    }
}
