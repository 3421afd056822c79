//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// Every variant is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Source errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Explicit config file path does not exist.
    #[error("configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// Config file exists but contains nothing.
    #[error("configuration file is empty: {path}")]
    EmptyConfigFile { path: PathBuf },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────────────────
    // Value errors
    // ─────────────────────────────────────────────────────────────────────────
    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {var}: {message}")]
    InvalidEnvValue {
        var: String,
        value: String,
        message: String,
    },

    /// One or more cross-field constraints failed.
    ///
    /// All problems found are reported together.
    #[error("invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_joins_all_problems() {
        let err = ConfigError::Invalid {
            problems: vec![
                "upstream.base_url is required".to_string(),
                "rate_limit.burst must be > 0".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: upstream.base_url is required; rate_limit.burst must be > 0"
        );
    }

    #[test]
    fn test_invalid_env_value_display() {
        let err = ConfigError::InvalidEnvValue {
            var: "TASKGATE_RATE_LIMIT_BURST".to_string(),
            value: "lots".to_string(),
            message: "invalid digit found in string".to_string(),
        };
        assert!(err.to_string().contains("TASKGATE_RATE_LIMIT_BURST"));
        assert!(err.to_string().contains("lots"));
    }
}
