//! Error types for the transports and the process entry point.
//!
//! `FramingError` covers NDJSON line failures on the stdio transport.
//! `ServeError` covers everything that stops the process from serving:
//! configuration, component assembly, and socket binding.

use taskgate_core::GatewayError;
use taskgate_core::config::ConfigError;
use taskgate_core::jsonrpc::ProtocolError;

/// Errors that can occur when reading an NDJSON-framed JSON-RPC message.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeds the maximum size. Checked before JSON parsing.
    #[error("Message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    /// The line is not valid UTF-8.
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// The line is not a valid JSON-RPC 2.0 request.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// JSON arrays are JSON-RPC batches, which MCP does not use.
    #[error("JSON-RPC batch requests (arrays) are not supported")]
    UnsupportedBatch,

    /// An underlying IO error occurred while reading stdin.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup / Serve Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to assemble gateway: {0}")]
    Gateway(#[from] GatewayError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stdio transport failed: {0}")]
    Framing(#[from] FramingError),

    #[error("shutdown timed out with {remaining} requests in flight")]
    DrainTimeout { remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_messages() {
        let err = FramingError::MessageTooLarge { max_bytes: 1024 };
        assert_eq!(err.to_string(), "Message exceeds maximum size of 1024 bytes");

        let err = FramingError::from(ProtocolError::Parse("EOF".into()));
        assert_eq!(err.to_string(), "Parse error: EOF");
    }

    #[test]
    fn test_bind_error_names_address() {
        let err = ServeError::Bind {
            addr: "0.0.0.0:8080".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("0.0.0.0:8080"));
    }
}
