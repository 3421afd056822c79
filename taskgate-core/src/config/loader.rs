//! Configuration loading: YAML file plus `TASKGATE_*` environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use super::error::ConfigError;
use super::{GatewayConfig, LogFormat, Secret, StoreBackend, TransportMode};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "TASKGATE_";

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "TASKGATE_CONFIG";

impl GatewayConfig {
    /// Load configuration from defaults, an optional file and the process
    /// environment.
    ///
    /// `explicit_path` (the `--config` flag) takes priority over
    /// `TASKGATE_CONFIG`. Without either, only defaults and environment apply.
    /// The result is not validated; call [`GatewayConfig::validate`] after
    /// CLI overrides have been applied.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file given, starting from defaults");
                Self::default()
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Err(ConfigError::EmptyConfigFile {
                path: path.to_path_buf(),
            });
        }
        let config: Self = serde_yaml::from_str(&contents)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `TASKGATE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides using an arbitrary lookup.
    ///
    /// Unparseable values are errors rather than warnings: a typo in a quota
    /// must not silently fall back to the default.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        env.string("UPSTREAM_URL", &mut self.upstream.base_url);
        env.string("UPSTREAM_API_PREFIX", &mut self.upstream.api_prefix);
        env.parse("UPSTREAM_TIMEOUT_SECS", &mut self.upstream.request_timeout_secs)?;
        env.parse("UPSTREAM_CONNECT_TIMEOUT_SECS", &mut self.upstream.connect_timeout_secs)?;
        env.parse("UPSTREAM_MAX_ATTEMPTS", &mut self.upstream.max_attempts)?;
        env.parse("UPSTREAM_RETRY_DELAY_MS", &mut self.upstream.retry_delay_ms)?;
        env.parse("UPSTREAM_MAX_BODY_BYTES", &mut self.upstream.max_response_body_bytes)?;

        env.parse::<StoreBackend>("STORE_BACKEND", &mut self.store.backend)?;
        env.string("REDIS_HOST", &mut self.store.host);
        env.parse("REDIS_PORT", &mut self.store.port)?;
        env.secret("REDIS_PASSWORD", &mut self.store.password);
        env.parse("REDIS_DB", &mut self.store.db)?;
        env.parse("REDIS_MAX_RETRIES", &mut self.store.max_retries)?;
        env.parse("REDIS_BASE_DELAY_MS", &mut self.store.base_delay_ms)?;
        env.parse("REDIS_MAX_DELAY_MS", &mut self.store.max_delay_ms)?;

        env.parse("RATE_LIMIT_ENABLED", &mut self.rate_limit.enabled)?;
        env.parse("RATE_LIMIT_WINDOW_SECS", &mut self.rate_limit.window_secs)?;
        env.parse("RATE_LIMIT_BURST", &mut self.rate_limit.burst)?;
        env.parse("RATE_LIMIT_ADMIN_BYPASS", &mut self.rate_limit.admin_bypass)?;
        if let Some(tokens) = env.get("RATE_LIMIT_ADMIN_TOKENS") {
            self.rate_limit.admin_tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(Secret::new)
                .collect();
        }

        env.parse("AUTH_CACHE_TTL_SECS", &mut self.auth.cache_ttl_secs)?;

        env.parse("SESSION_IDLE_TIMEOUT_SECS", &mut self.session.idle_timeout_secs)?;
        env.parse("SESSION_CLEANUP_INTERVAL_SECS", &mut self.session.cleanup_interval_secs)?;

        env.parse::<TransportMode>("TRANSPORT", &mut self.transport.mode)?;
        if let Some(port) = env.parsed::<u16>("PORT")? {
            self.transport.port = Some(port);
        }
        env.string("BIND", &mut self.transport.bind);
        env.secret("API_TOKEN", &mut self.transport.api_token);

        env.string("LOG_LEVEL", &mut self.logging.level);
        env.parse::<LogFormat>("LOG_FORMAT", &mut self.logging.format)?;

        env.parse("ADMIN_ENABLED", &mut self.admin.enabled)?;
        env.parse("ADMIN_PORT", &mut self.admin.port)?;

        env.parse("DRAIN_TIMEOUT_SECS", &mut self.shutdown.drain_timeout_secs)?;

        Ok(())
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}', expected redis or memory")),
        }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, suffix: &str, target: &mut String) {
        if let Some(value) = self.get(suffix) {
            *target = value;
        }
    }

    fn secret(&self, suffix: &str, target: &mut Option<Secret>) {
        if let Some(value) = self.get(suffix) {
            *target = Some(Secret::new(value));
        }
    }

    fn parsed<T>(&self, suffix: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(suffix) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvValue {
                var: format!("{ENV_PREFIX}{suffix}"),
                value: raw.clone(),
                message: e.to_string(),
            })
    }

    fn parse<T>(&self, suffix: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parsed(suffix)? {
            *target = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
upstream:
  base_url: "http://tasks.internal:3456"
rate_limit:
  burst: 10
  admin_bypass: true
transport:
  mode: http
  port: 8080
"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.upstream.base_url, "http://tasks.internal:3456");
        assert_eq!(config.rate_limit.burst, 10);
        assert!(config.rate_limit.admin_bypass);
        assert_eq!(config.transport.mode, TransportMode::Http);
        assert_eq!(config.transport.port, Some(8080));
        // Untouched sections keep defaults
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_yaml_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rate_limit:\n  brust: 10").unwrap();
        assert!(matches!(
            GatewayConfig::from_file(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            GatewayConfig::from_file(file.path()),
            Err(ConfigError::EmptyConfigFile { .. })
        ));
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = GatewayConfig::from_file(Path::new("/nonexistent/taskgate.yaml"));
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_env_with(lookup(&[
                ("TASKGATE_UPSTREAM_URL", "http://vikunja:3456"),
                ("TASKGATE_RATE_LIMIT_BURST", "5"),
                ("TASKGATE_RATE_LIMIT_ADMIN_TOKENS", "tok-a, tok-b,,"),
                ("TASKGATE_TRANSPORT", "HTTP"),
                ("TASKGATE_PORT", "9000"),
                ("TASKGATE_STORE_BACKEND", "memory"),
                ("TASKGATE_LOG_FORMAT", "pretty"),
            ]))
            .unwrap();

        assert_eq!(config.upstream.base_url, "http://vikunja:3456");
        assert_eq!(config.rate_limit.burst, 5);
        assert_eq!(config.rate_limit.admin_tokens.len(), 2);
        assert_eq!(config.rate_limit.admin_tokens[1].expose(), "tok-b");
        assert_eq!(config.transport.mode, TransportMode::Http);
        assert_eq!(config.transport.port, Some(9000));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_invalid_env_value_is_fatal() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env_with(lookup(&[("TASKGATE_RATE_LIMIT_BURST", "lots")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnvValue { var, value, .. } => {
                assert_eq!(var, "TASKGATE_RATE_LIMIT_BURST");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blank_env_value_ignored() {
        let mut config = GatewayConfig::default();
        config
            .apply_env_with(lookup(&[("TASKGATE_RATE_LIMIT_BURST", "  ")]))
            .unwrap();
        assert_eq!(config.rate_limit.burst, 100);
    }

    /// RAII guard that restores environment variables on drop.
    struct EnvVarGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvVarGuard {
        fn new(var_names: &[&'static str]) -> Self {
            let vars = var_names
                .iter()
                .map(|&name| (name, std::env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (name, original) in &self.vars {
                // SAFETY: single-threaded test context (enforced by #[serial])
                unsafe {
                    match original {
                        Some(val) => std::env::set_var(name, val),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_load_uses_config_env_and_process_env() {
        let _guard = EnvVarGuard::new(&[CONFIG_PATH_ENV, "TASKGATE_RATE_LIMIT_BURST"]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rate_limit:\n  burst: 10\n  window_secs: 30").unwrap();

        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, file.path());
            std::env::set_var("TASKGATE_RATE_LIMIT_BURST", "7");
        }

        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.rate_limit.window_secs, 30);
        // Environment wins over the file
        assert_eq!(config.rate_limit.burst, 7);
    }
}
