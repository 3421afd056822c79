//! Error taxonomy for the TaskGate admission layer.
//!
//! Every failure a client can observe is one of six kinds: authentication,
//! permission, not-found, validation, rate-limit, or internal. Errors are
//! created where the failure happens, travel unchanged through the request
//! pipeline, and are serialized exactly once at the transport boundary via
//! [`GatewayError::to_jsonrpc_error`].
//!
//! Upstream HTTP failures are translated by [`map_vikunja_error`], which is
//! total over every status (and over "no response at all").

pub mod jsonrpc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

pub use jsonrpc::{ErrorData, JsonRpcError};

/// The closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Permission,
    NotFound,
    Validation,
    RateLimit,
    Internal,
}

impl ErrorKind {
    /// All kinds, in code order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Authentication,
        ErrorKind::Permission,
        ErrorKind::NotFound,
        ErrorKind::Validation,
        ErrorKind::RateLimit,
        ErrorKind::Internal,
    ];

    /// Stable JSON-RPC error code for this kind.
    pub fn code(self) -> i32 {
        match self {
            Self::Authentication => -32001,
            Self::Permission => -32003,
            Self::NotFound => -32004,
            Self::Validation => -32602,
            Self::RateLimit => -32009,
            Self::Internal => -32603,
        }
    }

    /// Reverse of [`ErrorKind::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Machine-readable name used in logs, metrics labels and error data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Internal => "internal",
        }
    }

    /// HTTP status used by the networked transport.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Authentication => 401,
            Self::Permission => 403,
            Self::NotFound => 404,
            Self::Validation => 422,
            Self::RateLimit => 429,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors a request can fail with.
///
/// Each variant carries a message and an optional structured payload for
/// diagnostics. `RateLimit` additionally carries the window state a client
/// needs to back off correctly.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Authentication {
        message: String,
        details: Option<Value>,
    },

    #[error("{message}")]
    Permission {
        message: String,
        details: Option<Value>,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        details: Option<Value>,
    },

    #[error("{message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("{message}")]
    RateLimit {
        message: String,
        /// Requests left in the window (always 0 when rejected locally)
        remaining: u32,
        /// When the window that rejected the call resets
        reset_at: DateTime<Utc>,
        details: Option<Value>,
    },

    #[error("{message}")]
    Internal {
        message: String,
        details: Option<Value>,
    },
}

impl GatewayError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            details: None,
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn rate_limit(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self::RateLimit {
            message: "Rate limit exceeded".to_string(),
            remaining,
            reset_at,
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: None,
        }
    }

    /// Attach a structured diagnostic payload.
    #[must_use]
    pub fn with_details(mut self, payload: Value) -> Self {
        match &mut self {
            Self::Authentication { details, .. }
            | Self::Permission { details, .. }
            | Self::NotFound { details, .. }
            | Self::Validation { details, .. }
            | Self::RateLimit { details, .. }
            | Self::Internal { details, .. } => *details = Some(payload),
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Authentication { message, .. }
            | Self::Permission { message, .. }
            | Self::NotFound { message, .. }
            | Self::Validation { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Authentication { details, .. }
            | Self::Permission { details, .. }
            | Self::NotFound { details, .. }
            | Self::Validation { details, .. }
            | Self::RateLimit { details, .. }
            | Self::Internal { details, .. } => details.as_ref(),
        }
    }

    /// Seconds a client should wait before retrying, for rate-limit errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimit { reset_at, .. } => {
                let secs = (*reset_at - Utc::now()).num_seconds().max(1);
                Some(secs as u64)
            }
            _ => None,
        }
    }

    /// Converts the error into the client-visible JSON-RPC error object.
    ///
    /// Internal errors are reported generically with only the correlation id;
    /// the full message and payload stay in the server log.
    pub fn to_jsonrpc_error(&self, correlation_id: &str) -> JsonRpcError {
        let kind = self.kind();
        let (message, details) = match self {
            Self::Internal { .. } => (
                format!("Internal error. Reference: {correlation_id}"),
                None,
            ),
            other => (other.message().to_string(), other.details().cloned()),
        };
        let (remaining, reset_at) = match self {
            Self::RateLimit {
                remaining,
                reset_at,
                ..
            } => (Some(*remaining), Some(*reset_at)),
            _ => (None, None),
        };

        JsonRpcError {
            code: kind.code(),
            message,
            data: Some(ErrorData {
                correlation_id: correlation_id.to_string(),
                error_type: kind.as_str().to_string(),
                details,
                remaining,
                reset_at,
                retry_after: self.retry_after(),
            }),
        }
    }
}

/// Result alias used throughout the admission layer.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Map an upstream HTTP outcome onto the local taxonomy.
///
/// `status` is `None` when no response was received at all (connection
/// refused, timeout, DNS failure). The mapping is total and deterministic:
///
/// | Upstream | Kind |
/// |----------|------|
/// | 401 | Authentication |
/// | 403 | Permission |
/// | 404 | NotFound |
/// | 422 | Validation |
/// | 429 | RateLimit |
/// | anything else, or no response | Internal |
///
/// The upstream message is kept as the error message and is also embedded,
/// together with the status, in the structured payload.
pub fn map_vikunja_error(status: Option<u16>, message: impl Into<String>) -> GatewayError {
    let message = message.into();
    let payload = json!({
        "upstream_status": status,
        "upstream_message": message,
    });

    let error = match status {
        Some(401) => GatewayError::authentication(message),
        Some(403) => GatewayError::permission(message),
        Some(404) => GatewayError::not_found(message),
        Some(422) => GatewayError::validation(message),
        Some(429) => GatewayError::RateLimit {
            message,
            remaining: 0,
            reset_at: Utc::now(),
            details: None,
        },
        _ => GatewayError::internal(message),
    };
    error.with_details(payload)
}

/// Pull a human message out of an upstream error body.
///
/// The task API reports failures as `{"code": ..., "message": "..."}`; other
/// bodies fall back to the raw text, and empty bodies to the status line.
pub fn upstream_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value.get("message").and_then(Value::as_str)
        && !message.trim().is_empty()
    {
        return message.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("Upstream returned HTTP {status}")
    } else {
        trimmed.to_string()
    }
}
