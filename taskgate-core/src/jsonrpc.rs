//! JSON-RPC 2.0 message types shared by every transport.
//!
//! Parsing works from raw bytes (an NDJSON line or an HTTP body). Protocol
//! failures (malformed JSON, wrong envelope) are reported with the standard
//! JSON-RPC codes and never reach the admission pipeline.

use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::JsonRpcError;

/// JSON-RPC 2.0 version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard code for malformed JSON.
pub const PARSE_ERROR: i32 = -32700;
/// Standard code for a structurally invalid request.
pub const INVALID_REQUEST: i32 = -32600;

// ============================================================================
// Request ID
// ============================================================================

/// JSON-RPC request id: integer, string, or explicit null.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_id(&value).ok_or_else(|| {
            serde::de::Error::custom("JSON-RPC ID must be string, integer, or null")
        })
    }
}

fn parse_id(value: &Value) -> Option<JsonRpcId> {
    match value {
        Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
        Value::String(s) => Some(JsonRpcId::String(s.clone())),
        Value::Null => Some(JsonRpcId::Null),
        _ => None,
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => f.write_str(s),
            JsonRpcId::Null => f.write_str("null"),
        }
    }
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// A message that could not be turned into a [`JsonRpcRequest`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Echoed back when it could be read from the message
        id: Option<JsonRpcId>,
        reason: String,
    },
}

impl ProtocolError {
    /// The error response to send back. Parse errors answer with a null id.
    pub fn to_response(&self) -> JsonRpcResponse {
        match self {
            Self::Parse(_) => JsonRpcResponse::error(
                None,
                JsonRpcError {
                    code: PARSE_ERROR,
                    message: self.to_string(),
                    data: None,
                },
            ),
            Self::InvalidRequest { id, .. } => JsonRpcResponse::error(
                id.clone(),
                JsonRpcError {
                    code: INVALID_REQUEST,
                    message: self.to_string(),
                    data: None,
                },
            ),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Validated JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    /// `None` for notifications. An explicit `"id": null` is `Some(Null)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Option<JsonRpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            method: method.into(),
            params,
        }
    }

    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse one request from raw bytes.
    ///
    /// # Errors
    ///
    /// `Parse` for malformed JSON, `InvalidRequest` for anything that is not
    /// a single JSON-RPC 2.0 request object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::InvalidRequest {
                id: None,
                reason: "expected a JSON object".to_string(),
            });
        };

        let id = match object.remove("id") {
            None => None,
            Some(raw) => Some(parse_id(&raw).ok_or_else(|| ProtocolError::InvalidRequest {
                id: None,
                reason: "id must be a string, integer, or null".to_string(),
            })?),
        };
        let invalid = |reason: &str| ProtocolError::InvalidRequest {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(invalid("jsonrpc must be \"2.0\""));
        }
        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            Some(_) => return Err(invalid("method must be a non-empty string")),
            None => return Err(invalid("missing method")),
        };
        let params = match object.remove("params") {
            None | Some(Value::Null) => None,
            Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
            Some(_) => return Err(invalid("params must be an object or array")),
        };

        Ok(Self::new(id, method, params))
    }
}

// ============================================================================
// Response
// ============================================================================

/// JSON-RPC 2.0 response.
///
/// `id` always serializes; `None` becomes `"id": null` as required when the
/// request id could not be determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
