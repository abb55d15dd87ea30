//! Response envelope validation
//!
//! The destination wraps every JSON reply as `{"ok": 1, "data": ...}` (or
//! `"msg"` instead of `"data"`). A present `ok` other than 1, or a body that
//! is not JSON, is a protocol violation; a body without `ok` is accepted.

use serde_json::Value;

use crate::error::{PlatformError, RawResponse, Result};

/// Validate an envelope and return its flat payload
///
/// `data` wins over `msg`; an empty or false-like value in either falls
/// through, and when neither carries anything the whole body is returned.
pub fn unwrap_envelope(raw: RawResponse) -> Result<Value> {
    let Ok(body) = serde_json::from_str::<Value>(&raw.body) else {
        return Err(PlatformError::UnexpectedResponse(raw).into());
    };

    match body.get("ok") {
        None | Some(Value::Null) => {}
        Some(flag) if is_ok(flag) => {}
        Some(_) => return Err(PlatformError::UnexpectedResponse(raw).into()),
    }

    let payload = ["data", "msg"]
        .iter()
        .filter_map(|field| body.get(*field))
        .find(|value| is_truthy(value))
        .cloned();
    Ok(payload.unwrap_or(body))
}

fn is_ok(flag: &Value) -> bool {
    match flag {
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s == "1",
        Value::Bool(b) => *b,
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
