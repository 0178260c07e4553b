//! JSON-RPC envelope decoding and encoding.
//!
//! Every line on an agent stream is one JSON object. The tag is chosen from
//! which keys are present, never from their values:
//!
//! | Keys present                    | Decoded as                        |
//! |---------------------------------|-----------------------------------|
//! | `id` and (`result` or `error`)  | [`RawMessage::Response`]          |
//! | `id` and `method`               | [`RawMessage::Request`]           |
//! | `method`                        | [`RawMessage::Notification`]      |
//! | *(anything else)*               | [`AppError::Decode`]              |
//!
//! Some agents print log noise before their first JSON line. When strict
//! parsing fails, decoding retries from the first `{` in the line.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// JSON-RPC protocol version written on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of a request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (what this client assigns).
    Number(i64),
    /// String id (some agents use these).
    String(String),
    /// `null` id, used by agents answering a request they could not parse.
    Null,
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Requested method is not handled by this client.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params did not match the method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler failed while serving a request.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Build an error object without `data`.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// A request: has both `id` and `method`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Parameters, if the key was present.
    pub params: Option<Value>,
}

/// Outcome carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful `result` (may be `null`).
    Result(Value),
    /// Failed call.
    Error(RpcError),
}

/// A response: has `id` and one of `result` / `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request being answered.
    pub id: RequestId,
    /// Result or error.
    pub payload: ResponsePayload,
}

/// A notification: has `method` and no `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Parameters, if the key was present.
    pub params: Option<Value>,
}

/// One decoded protocol envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Peer-initiated call expecting a response.
    Request(Request),
    /// Answer to a call we made.
    Response(Response),
    /// Fire-and-forget message.
    Notification(Notification),
}

impl RawMessage {
    /// Build a request envelope.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification envelope.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Build a successful response envelope.
    pub fn result(id: RequestId, result: Value) -> Self {
        Self::Response(Response {
            id,
            payload: ResponsePayload::Result(result),
        })
    }

    /// Build an error response envelope.
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self::Response(Response {
            id,
            payload: ResponsePayload::Error(error),
        })
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

/// Decode one line into a [`RawMessage`].
///
/// # Errors
///
/// - [`AppError::Decode`]`("malformed json: …")` when neither the line nor
///   the suffix starting at its first `{` parses as JSON.
/// - [`AppError::Decode`]`("expected JSON object …")` for non-object JSON.
/// - [`AppError::Decode`]`("unable to determine message type …")` when the
///   object matches none of the three tag patterns.
pub fn decode(line: &str) -> Result<RawMessage> {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(strict_err) => {
            let Some(start) = line.find('{') else {
                return Err(AppError::Decode(format!("malformed json: {strict_err}")));
            };
            serde_json::from_str::<Value>(&line[start..])
                .map_err(|e| AppError::Decode(format!("malformed json: {e}")))?
        }
    };

    match value {
        Value::Object(object) => classify(object),
        other => Err(AppError::Decode(format!(
            "expected JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Encode a [`RawMessage`] as a single line of JSON without a terminator.
///
/// # Errors
///
/// Returns [`AppError::Decode`] if a contained value cannot be serialised
/// (not expected for `serde_json::Value` payloads).
pub fn encode(message: &RawMessage) -> Result<String> {
    let mut object = Map::new();
    object.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));

    match message {
        RawMessage::Request(request) => {
            object.insert("id".into(), serde_json::to_value(&request.id)?);
            object.insert("method".into(), Value::String(request.method.clone()));
            if let Some(params) = &request.params {
                object.insert("params".into(), params.clone());
            }
        }
        RawMessage::Response(response) => {
            object.insert("id".into(), serde_json::to_value(&response.id)?);
            match &response.payload {
                ResponsePayload::Result(result) => {
                    object.insert("result".into(), result.clone());
                }
                ResponsePayload::Error(error) => {
                    object.insert("error".into(), serde_json::to_value(error)?);
                }
            }
        }
        RawMessage::Notification(notification) => {
            object.insert("method".into(), Value::String(notification.method.clone()));
            if let Some(params) = &notification.params {
                object.insert("params".into(), params.clone());
            }
        }
    }

    // serde_json escapes control characters inside strings, so the compact
    // form never contains a raw line break.
    Ok(serde_json::to_string(&Value::Object(object))?)
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn classify(mut object: Map<String, Value>) -> Result<RawMessage> {
    let has_id = object.contains_key("id");
    let has_method = object.contains_key("method");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if has_id && (has_result || has_error) {
        let id = take_id(&mut object)?;
        let error = object.remove("error").filter(|e| !e.is_null());
        let payload = match error {
            Some(error) => ResponsePayload::Error(
                serde_json::from_value(error)
                    .map_err(|e| AppError::Decode(format!("invalid error object: {e}")))?,
            ),
            None => ResponsePayload::Result(object.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(RawMessage::Response(Response { id, payload }));
    }

    if has_id && has_method {
        let id = take_id(&mut object)?;
        let method = take_method(&mut object)?;
        return Ok(RawMessage::Request(Request {
            id,
            method,
            params: object.remove("params"),
        }));
    }

    if has_method {
        let method = take_method(&mut object)?;
        return Ok(RawMessage::Notification(Notification {
            method,
            params: object.remove("params"),
        }));
    }

    Err(AppError::Decode(
        "unable to determine message type from JSON structure".into(),
    ))
}

fn take_id(object: &mut Map<String, Value>) -> Result<RequestId> {
    let raw = object.remove("id").unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| AppError::Decode(format!("invalid id: {e}")))
}

fn take_method(object: &mut Map<String, Value>) -> Result<String> {
    match object.remove("method") {
        Some(Value::String(method)) => Ok(method),
        Some(other) => Err(AppError::Decode(format!(
            "method must be a string, got {}",
            json_kind(&other)
        ))),
        None => Err(AppError::Decode("missing method".into())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
