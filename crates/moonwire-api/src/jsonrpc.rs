//! JSON-RPC 2.0 envelopes as spoken by Moonraker.
//!
//! Outbound frames are built from borrowed parts; inbound frames are
//! classified into responses (routed by `id`) and server notifications
//! (routed by `method`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorObject;

pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier of an in-flight request. `0` is never issued.
pub type RequestId = u64;

/// Handle returned by `register_notify_update`. `0` is never issued.
pub type SubscriptionId = u64;

pub const INVALID_REQUEST_ID: RequestId = 0;
pub const INVALID_SUBSCRIPTION_ID: SubscriptionId = 0;

// ── Outbound ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
}

/// Serialize a request frame. `id: None` produces a fire-and-forget frame.
///
/// `params` is dropped when it is `null`, `{}` or `[]`.
pub fn encode_request(
    method: &str,
    params: Option<&Value>,
    id: Option<RequestId>,
) -> Result<String, serde_json::Error> {
    let params = params.filter(|p| !is_empty_params(p));
    serde_json::to_string(&RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
    })
}

fn is_empty_params(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// A server-initiated notification (no `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// First positional parameter: the status delta for `notify_status_update`,
    /// the console line for `notify_gcode_response`.
    pub fn payload(&self) -> Option<&Value> {
        self.params.as_array().and_then(|p| p.first())
    }
}

/// A classified inbound frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Response {
        id: RequestId,
        outcome: Result<Value, ErrorObject>,
    },
    Notification(Notification),
    /// Well-formed JSON that is neither a response nor a notification.
    Ignored(&'static str),
}

/// Classify a text frame.
///
/// Works on a raw [`Value`] rather than a typed struct so that
/// `"result": null` stays distinguishable from a missing `result`.
pub(crate) fn decode_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let mut frame: Value = serde_json::from_str(text)?;
    let Some(object) = frame.as_object_mut() else {
        return Ok(Inbound::Ignored("frame is not an object"));
    };

    if let Some(method) = object.get("method") {
        let Some(method) = method.as_str() else {
            return Ok(Inbound::Ignored("non-string method"));
        };
        let method = method.to_owned();
        let params = object.remove("params").unwrap_or(Value::Null);
        return Ok(Inbound::Notification(Notification { method, params }));
    }

    let Some(id) = object.get("id") else {
        return Ok(Inbound::Ignored("neither id nor method"));
    };
    let Some(id) = id.as_u64() else {
        return Ok(Inbound::Ignored("non-integer id"));
    };

    let outcome = match object.remove("error") {
        None | Some(Value::Null) => Ok(object.remove("result").unwrap_or(Value::Null)),
        Some(error) => Err(error_object(error)),
    };
    Ok(Inbound::Response { id, outcome })
}

/// Read an `error` member leniently. The server still answered, so a shape
/// other than `{code, message}` becomes code `0` with the error as text.
fn error_object(error: Value) -> ErrorObject {
    if let Ok(object) = ErrorObject::deserialize(&error) {
        return object;
    }
    let message = match error {
        Value::String(message) => message,
        Value::Object(ref map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_owned(),
            None => error.to_string(),
        },
        other => other.to_string(),
    };
    ErrorObject { code: 0, message }
}
