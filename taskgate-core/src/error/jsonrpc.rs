//! JSON-RPC 2.0 error envelope.
//!
//! Every [`GatewayError`](super::GatewayError) that reaches a transport
//! boundary is serialized into this shape, regardless of which transport
//! carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Stable numeric code for the error kind
    pub code: i32,

    /// Human-readable message, safe to show to the calling client
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// Additional error context.
///
/// All fields are safe for client consumption. The raw credential never
/// appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorData {
    /// Identifier for locating this error in the server log
    pub correlation_id: String,

    /// Machine-readable kind name ("authentication", "rate_limit", ...)
    pub error_type: String,

    /// Kind-specific structured payload (sanitized)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Requests left in the current window (rate-limit errors only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,

    /// When the current window resets (rate-limit errors only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,

    /// Suggested retry delay in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_without_data() {
        let error = JsonRpcError {
            code: -32603,
            message: "Internal error".to_string(),
            data: None,
        };

        let json = serde_json::to_string(&error).unwrap();
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_rate_limit_fields_serialized() {
        let reset_at = DateTime::parse_from_rfc3339("2026-01-01T00:01:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let error = JsonRpcError {
            code: -32009,
            message: "Rate limit exceeded".to_string(),
            data: Some(ErrorData {
                correlation_id: "req-1".to_string(),
                error_type: "rate_limit".to_string(),
                details: None,
                remaining: Some(0),
                reset_at: Some(reset_at),
                retry_after: Some(60),
            }),
        };

        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["data"]["remaining"], 0);
        assert_eq!(json["data"]["retry_after"], 60);
        assert_eq!(json["data"]["reset_at"], "2026-01-01T00:01:00Z");
    }

    #[test]
    fn test_optional_fields_omitted() {
        let error = JsonRpcError {
            code: -32001,
            message: "Authentication failed".to_string(),
            data: Some(ErrorData {
                correlation_id: "req-2".to_string(),
                error_type: "authentication".to_string(),
                ..ErrorData::default()
            }),
        };

        let json_str = serde_json::to_string(&error).unwrap();
        assert!(!json_str.contains("\"details\""));
        assert!(!json_str.contains("\"remaining\""));
        assert!(!json_str.contains("\"reset_at\""));
        assert!(!json_str.contains("\"retry_after\""));
    }
}
