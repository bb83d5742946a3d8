//! Line-delimited JSON protocol spoken with sandboxed workers.
//!
//! One request per line on the worker's stdin:
//! `{"action": "...", "payload": {...}}`
//!
//! One response per line on its stdout, always an object carrying
//! `"status": "ok"` or `"status": "error"`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Liveness probe answered by every worker.
pub const PING_ACTION: &str = "ping";

/// Environment variable carrying the worker's address-space limit in MB.
/// Zero or absent means unlimited.
pub const MAX_MEMORY_ENV: &str = "PALISADE_MAX_MEMORY_MB";

/// A request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Request {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(PING_ACTION, empty_object())
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

/// Checks the response envelope and returns its status.
pub fn response_status(response: &Value) -> Result<Status, String> {
    let Value::Object(map) = response else {
        return Err("response is not a JSON object".to_string());
    };
    match map.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(Status::Ok),
        Some("error") => Ok(Status::Error),
        Some(other) => Err(format!("unknown status '{other}'")),
        None => Err("response has no status".to_string()),
    }
}

/// Wraps a plugin return value in a success envelope.
///
/// Objects without a `status` get `"status": "ok"`; any other value becomes
/// `{"status": "ok", "result": value}`.
pub fn normalize_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.entry("status")
                .or_insert_with(|| Value::String("ok".to_string()));
            Value::Object(map)
        }
        other => json!({ "status": "ok", "result": other }),
    }
}

/// Builds an error envelope.
pub fn error_response(message: impl Into<String>, code: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "msg": message.into(),
        "code": code.into(),
    })
}
