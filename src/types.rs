//! JSON-RPC 2.0 wire types
//!
//! This module defines the on-wire request and response shapes shared by the
//! server dispatcher and the client correlator, plus the request-id
//! normalization used for duplicate detection and response correlation.
//!
//! All types derive `Debug`, `Clone`, `Serialize`, and `Deserialize`.
//! Optional fields omit their key from JSON when `None` via
//! `#[serde(skip_serializing_if = "Option::is_none")]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The protocol version marker carried in every message.
pub const VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request object.
///
/// A request without an `id` is a *notification*: the server owes it no
/// response, even on error. A legal `id` is a JSON string or number; an
/// explicit `"id": null` is neither a scalar nor absent, so the dispatcher
/// rejects it as an invalid request rather than treating it as a
/// notification.
///
/// # Examples
///
/// ```
/// use switchboard::types::Request;
///
/// let req: Request = serde_json::from_str(
///     r#"{"jsonrpc":"2.0","id":1,"method":"Math.Add","params":[2,3]}"#,
/// ).unwrap();
/// assert_eq!(req.method, "Math.Add");
/// assert!(!req.is_notification());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version marker. `"2.0"` on the wire; an empty string is
    /// accepted on ingress only when the server runs in v1-compatible mode.
    #[serde(rename = "jsonrpc", default)]
    pub version: String,
    /// Request correlation identifier. Absent for notifications.
    #[serde(
        default,
        deserialize_with = "id_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    /// The method name to invoke.
    #[serde(default)]
    pub method: String,
    /// Optional method parameters (object, array, or any JSON value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Build a call request with the given id.
    pub fn call(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Build a notification (a request with no id).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this request is a notification (its `id` field is absent).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Deserialize the `id` field without collapsing `null` into absence.
///
/// `Option<Value>` would decode `"id": null` as `None`, which is how the
/// serde data model spells a *missing* field; the dispatcher needs the two
/// apart because a null id is an invalid request, not a notification.
fn id_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A JSON-RPC 2.0 response object.
///
/// Exactly one of `result` or `error` is present in a valid response; the
/// constructors below enforce that. `id` echoes the request's id, or is
/// JSON `null` for errors reported against an unparseable request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version marker; always `"2.0"` on egress.
    #[serde(rename = "jsonrpc", default)]
    pub version: String,
    /// Mirrors the `id` from the corresponding request.
    #[serde(default)]
    pub id: Value,
    /// Successful result value; mutually exclusive with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Build a successful response. A `null` result is still carried on the
    /// wire as `"result": null`.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            version: VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: Value, error: ErrorObject) -> Self {
        Self {
            version: VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split the response into its result value or its error object.
    ///
    /// A response carrying neither key yields `Ok(Value::Null)`.
    pub fn into_result(self) -> std::result::Result<Value, ErrorObject> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
///
/// # Examples
///
/// ```
/// use switchboard::types::ErrorObject;
///
/// let e = ErrorObject::new(-32601, "method not found: Nope");
/// assert_eq!(e.to_string(), "[-32601] method not found: Nope");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code as defined by JSON-RPC 2.0 or this runtime.
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
    /// Optional additional error context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an error object with no auxiliary data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach an auxiliary data value.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorObject {}

/// Whether `v` is a legal request id (a JSON string or number).
pub fn is_valid_id(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_))
}

/// Canonicalize a request id to its minimal JSON form.
///
/// Numeric ids that carry an integral value are reduced to the integer
/// spelling (`1.0` becomes `1`) so that duplicate detection and response
/// correlation compare equal values equally. String ids and
/// non-canonicalizable numbers pass through unchanged.
///
/// # Examples
///
/// ```
/// use switchboard::types::normalize_id;
///
/// assert_eq!(normalize_id(&serde_json::json!(1.0)), serde_json::json!(1));
/// assert_eq!(normalize_id(&serde_json::json!("1")), serde_json::json!("1"));
/// ```
pub fn normalize_id(v: &Value) -> Value {
    if let Value::Number(n) = v {
        if n.is_i64() || n.is_u64() {
            return v.clone();
        }
        if let Some(f) = n.as_f64() {
            // 2^53 bounds the integers a double represents exactly.
            if f.is_finite() && f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0 {
                return Value::from(f as i64);
            }
        }
    }
    v.clone()
}

/// The canonical string key for a request id, used by the server's
/// active-id set and the client's pending-call table. Returns `None` for an
/// absent or `null` id (a notification).
pub fn id_key(v: &Value) -> Option<String> {
    if v.is_null() {
        return None;
    }
    Some(normalize_id(v).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
