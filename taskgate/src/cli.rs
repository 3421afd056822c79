//! Command-line interface.
//!
//! Flags are the last configuration layer: they override the YAML file and
//! `TASKGATE_*` environment variables. Kept apart from `main.rs` so tests can
//! parse argument vectors directly.

use std::path::PathBuf;

use clap::Parser;
use taskgate_core::config::{ConfigError, GatewayConfig, LogFormat, Secret, TransportMode};

/// TaskGate MCP gateway.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file.
    #[arg(short, long, env = "TASKGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inbound transport: stdio or http.
    #[arg(short, long)]
    pub transport: Option<TransportMode>,

    /// Listen port for the HTTP transport.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bind address for the HTTP transport.
    #[arg(long)]
    pub bind: Option<String>,

    /// Base URL of the task API (without /api/v1).
    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Admin (health/metrics) port.
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Disable the admin server.
    #[arg(long)]
    pub no_admin: bool,

    /// Log filter directive, e.g. "info" or "taskgate_core=debug".
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format: json or pretty.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Validate configuration and exit.
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    /// Apply flag overrides on top of a loaded configuration.
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(mode) = self.transport {
            config.transport.mode = mode;
        }
        if let Some(port) = self.port {
            config.transport.port = Some(port);
        }
        if let Some(bind) = &self.bind {
            config.transport.bind = bind.clone();
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.base_url = url.clone();
        }
        if let Some(port) = self.admin_port {
            config.admin.port = port;
        }
        if self.no_admin {
            config.admin.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }

    /// Load, override, and validate the full configuration.
    ///
    /// # Errors
    ///
    /// Any load failure, or every validation problem in one `Invalid`.
    pub fn resolve_config(&self) -> Result<GatewayConfig, ConfigError> {
        let mut config = GatewayConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Redacted view of a secret for `--check` output.
pub fn describe_secret(secret: Option<&Secret>) -> &'static str {
    match secret {
        Some(s) if !s.is_empty() => "set",
        _ => "unset",
    }
}
