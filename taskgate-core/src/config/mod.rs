//! Gateway configuration.
//!
//! A single typed [`GatewayConfig`] with nested sections. Every field has a
//! default, so an empty YAML document is a valid starting point. Values are
//! layered in this order, later sources winning:
//!
//! 1. Built-in defaults
//! 2. Optional YAML file (`--config` / `TASKGATE_CONFIG`)
//! 3. `TASKGATE_*` environment variables
//! 4. CLI flags (applied by the binary)
//!
//! [`GatewayConfig::validate`] runs once at startup and reports every
//! cross-field problem in one [`ConfigError::Invalid`].

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::{CONFIG_PATH_ENV, ENV_PREFIX};

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Secret
// ============================================================================

/// A configuration string that must never appear in logs.
///
/// `Debug` prints a placeholder. Use [`Secret::expose`] at the point of use.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
    pub admin: AdminConfig,
    pub shutdown: ShutdownConfig,
}

// ============================================================================
// Sections
// ============================================================================

/// Upstream task API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the task API, without the version prefix.
    pub base_url: String,
    /// Versioned path prefix appended to every request.
    pub api_prefix: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Total attempts per logical call, including the first.
    pub max_attempts: u32,
    /// Attempt `n` waits `retry_delay_ms × n` before retrying.
    pub retry_delay_ms: u64,
    pub max_response_body_bytes: usize,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_prefix: "/api/v1".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            max_attempts: 3,
            retry_delay_ms: 1000,
            max_response_body_bytes: 10 * 1024 * 1024,
            pool_max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Base URL joined with the API prefix, without a trailing slash.
    pub fn api_base(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{prefix}")
        }
    }
}

/// Which rate-limit store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance (multi-replica deployments).
    #[default]
    Redis,
    /// In-process store; counters are per-replica.
    Memory,
}

/// Shared key-value store for rate-limit counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub host: String,
    pub port: u16,
    pub password: Option<Secret>,
    pub db: i64,
    /// Connect attempts before giving up.
    pub max_retries: u32,
    /// Attempt `n` waits `n × base_delay_ms`, capped at `max_delay_ms`.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

impl StoreConfig {
    /// `redis://` URL for the configured instance.
    ///
    /// Contains the password when one is set; never log the result.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password.expose(),
                self.host,
                self.port,
                self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-identity sliding-window quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// When false every request is admitted.
    pub enabled: bool,
    pub window_secs: u64,
    /// Maximum requests per identity within one window.
    pub burst: u32,
    /// Whether allowlisted identities skip the limiter.
    pub admin_bypass: bool,
    /// Identities placed on the allowlist at startup.
    pub admin_tokens: Vec<Secret>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            burst: 100,
            admin_bypass: false,
            admin_tokens: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
        }
    }
}

impl AuthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Long-lived client sessions (SSE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Outbound event buffer per session.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            cleanup_interval_secs: 60,
            channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One local client over stdin/stdout.
    #[default]
    Stdio,
    /// Networked clients over HTTP and SSE.
    Http,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown transport '{other}', expected stdio or http")),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Listen port for HTTP mode. Required when `mode = http`.
    pub port: Option<u16>,
    pub bind: String,
    /// Credential for the single stdio client. Required when `mode = stdio`.
    pub api_token: Option<Secret>,
    /// Maximum accepted request body in HTTP mode.
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Stdio,
            port: None,
            bind: "0.0.0.0".to_string(),
            api_token: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}', expected json or pretty")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Health, readiness, status and metrics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7469,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight requests after sessions are closed.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 25,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl GatewayConfig {
    /// Check every cross-field constraint.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let base_url = self.upstream.base_url.trim();
        if base_url.is_empty() {
            problems.push("upstream.base_url is required".to_string());
        } else if let Err(e) = reqwest::Url::parse(base_url) {
            problems.push(format!("upstream.base_url '{base_url}' is not a valid URL: {e}"));
        }
        if self.upstream.max_attempts == 0 {
            problems.push("upstream.max_attempts must be > 0".to_string());
        }

        if self.store.backend == StoreBackend::Redis {
            if self.store.host.trim().is_empty() {
                problems.push("store.host is required for the redis backend".to_string());
            }
            if self.store.max_retries == 0 {
                problems.push("store.max_retries must be > 0".to_string());
            }
            if self.store.base_delay_ms > self.store.max_delay_ms {
                problems.push(format!(
                    "store.base_delay_ms ({}) exceeds store.max_delay_ms ({})",
                    self.store.base_delay_ms, self.store.max_delay_ms
                ));
            }
        }

        if self.rate_limit.burst == 0 {
            problems.push("rate_limit.burst must be > 0".to_string());
        }
        if self.rate_limit.window_secs == 0 {
            problems.push("rate_limit.window_secs must be > 0".to_string());
        }

        if self.auth.cache_ttl_secs == 0 {
            problems.push("auth.cache_ttl_secs must be > 0".to_string());
        }

        if self.session.idle_timeout_secs == 0 {
            problems.push("session.idle_timeout_secs must be > 0".to_string());
        }
        if self.session.cleanup_interval_secs == 0 {
            problems.push("session.cleanup_interval_secs must be > 0".to_string());
        } else if self.session.cleanup_interval_secs > self.session.idle_timeout_secs {
            problems.push(format!(
                "session.cleanup_interval_secs ({}) exceeds session.idle_timeout_secs ({})",
                self.session.cleanup_interval_secs, self.session.idle_timeout_secs
            ));
        }
        if self.session.channel_capacity == 0 {
            problems.push("session.channel_capacity must be > 0".to_string());
        }

        match self.transport.mode {
            TransportMode::Http => match self.transport.port {
                None => problems.push("transport.port is required for http transport".to_string()),
                Some(port) if self.admin.enabled && port == self.admin.port => {
                    problems.push(format!(
                        "transport.port ({port}) collides with admin.port"
                    ));
                }
                Some(_) => {}
            },
            TransportMode::Stdio => {
                if self.transport.api_token.as_ref().is_none_or(Secret::is_empty) {
                    problems.push(
                        "transport.api_token (TASKGATE_API_TOKEN) is required for stdio transport"
                            .to_string(),
                    );
                }
            }
        }

        if self
            .logging
            .level
            .parse::<tracing::level_filters::LevelFilter>()
            .is_err()
            && !self.logging.level.contains('=')
        {
            problems.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_http() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.upstream.base_url = "http://tasks.internal:3456".to_string();
        config.transport.mode = TransportMode::Http;
        config.transport.port = Some(8080);
        config
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.auth.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.upstream.max_attempts, 3);
        assert_eq!(config.store.max_retries, 5);
        assert!(!config.rate_limit.admin_bypass);
    }

    #[test]
    fn test_valid_http_config() {
        assert!(valid_http().validate().is_ok());
    }

    #[test]
    fn test_validation_reports_all_problems_together() {
        let mut config = GatewayConfig::default();
        config.transport.mode = TransportMode::Http;
        config.rate_limit.burst = 0;
        config.session.idle_timeout_secs = 30;
        config.session.cleanup_interval_secs = 60;

        let Err(ConfigError::Invalid { problems }) = config.validate() else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("upstream.base_url")));
        assert!(problems.iter().any(|p| p.contains("transport.port")));
        assert!(problems.iter().any(|p| p.contains("rate_limit.burst")));
        assert!(problems.iter().any(|p| p.contains("cleanup_interval_secs")));
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn test_stdio_requires_api_token() {
        let mut config = valid_http();
        config.transport.mode = TransportMode::Stdio;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_token"));

        config.transport.api_token = Some(Secret::new("tok-1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_retry_ceilings_rejected() {
        let mut config = valid_http();
        config.upstream.max_attempts = 0;
        config.store.max_retries = 0;
        let Err(ConfigError::Invalid { problems }) = config.validate() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_memory_backend_skips_store_checks() {
        let mut config = valid_http();
        config.store.backend = StoreBackend::Memory;
        config.store.max_retries = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_collision_with_admin() {
        let mut config = valid_http();
        config.transport.port = Some(config.admin.port);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_base_joins_prefix() {
        let mut upstream = UpstreamConfig {
            base_url: "http://tasks.internal/".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(upstream.api_base(), "http://tasks.internal/api/v1");
        upstream.api_prefix = String::new();
        assert_eq!(upstream.api_base(), "http://tasks.internal");
    }

    #[test]
    fn test_redis_url_with_password() {
        let mut store = StoreConfig::default();
        assert_eq!(store.redis_url(), "redis://127.0.0.1:6379/0");
        store.password = Some(Secret::new("hunter2"));
        assert_eq!(store.redis_url(), "redis://:hunter2@127.0.0.1:6379/0");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let mut config = valid_http();
        config.transport.api_token = Some(Secret::new("super-secret-token"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-token"));
    }
}
