//! Startup and shutdown ordering.
//!
//! ```text
//! assemble ─▶ start ─▶ admin + transport ─▶ (signal | transport exit)
//!                                                   │
//!              mark_stopped ◀─ drain ◀─ close sessions ◀─ begin_shutdown
//! ```

use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskgate_core::Gateway;
use taskgate_core::config::{ConfigError, GatewayConfig, Secret, TransportMode};
use taskgate_core::lifecycle::DrainResult;

use crate::admin::AdminServer;
use crate::error::ServeError;
use crate::transport::{StdioTransport, http};

/// Serve until `signal` fires or the transport ends on its own (stdin EOF,
/// bind failure), then shut down gracefully.
///
/// # Errors
///
/// The transport's own failure if it had one, otherwise `DrainTimeout` when
/// requests were still running at the drain deadline.
pub async fn run(config: GatewayConfig, signal: CancellationToken) -> Result<(), ServeError> {
    let mode = TransportChoice::from_config(&config)?;
    let mut registry = Registry::default();
    let gateway = Arc::new(Gateway::from_config(&config, &mut registry)?);
    let registry = Arc::new(registry);
    let shutdown = gateway.lifecycle().shutdown_token();

    let background = gateway.start().await;

    let admin_task = config.admin.enabled.then(|| {
        let admin = AdminServer::new(
            Arc::clone(&gateway),
            Arc::clone(&registry),
            &config.transport.bind,
            config.admin.port,
        );
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin.run(token).await {
                error!(error = %e, "Admin server failed");
            }
        })
    });

    let mut transport_task = spawn_transport(mode, &config, Arc::clone(&gateway), shutdown);
    info!(
        transport = %config.transport.mode,
        version = gateway.lifecycle().version(),
        "TaskGate started"
    );

    let finished_early = tokio::select! {
        _ = signal.cancelled() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut transport_task => {
            info!("Transport stopped, shutting down");
            Some(result)
        }
    };

    let drain = gateway.shutdown().await;

    let transport_result = match finished_early {
        Some(result) => result,
        None => transport_task.await,
    }
    .unwrap_or_else(|e| Err(ServeError::Io(std::io::Error::other(e))));

    if let Some(task) = admin_task {
        let _ = task.await;
    }
    for task in background {
        let _ = task.await;
    }

    transport_result?;
    match drain {
        DrainResult::Complete => {
            info!("Shutdown complete");
            Ok(())
        }
        DrainResult::Timeout { remaining } => Err(ServeError::DrainTimeout { remaining }),
    }
}

enum TransportChoice {
    Stdio(Secret),
    Http,
}

impl TransportChoice {
    fn from_config(config: &GatewayConfig) -> Result<Self, ServeError> {
        match config.transport.mode {
            TransportMode::Http => Ok(Self::Http),
            TransportMode::Stdio => match &config.transport.api_token {
                Some(token) if !token.is_empty() => Ok(Self::Stdio(token.clone())),
                _ => Err(ConfigError::Invalid {
                    problems: vec!["transport.api_token is required for stdio transport".into()],
                }
                .into()),
            },
        }
    }
}

fn spawn_transport(
    mode: TransportChoice,
    config: &GatewayConfig,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), ServeError>> {
    match mode {
        TransportChoice::Stdio(credential) => {
            let transport =
                StdioTransport::new(gateway, credential, config.transport.max_body_bytes);
            tokio::spawn(async move {
                transport.serve_stdio(shutdown).await?;
                Ok(())
            })
        }
        TransportChoice::Http => {
            let transport_config = config.transport.clone();
            let session_config = config.session.clone();
            tokio::spawn(async move {
                let result =
                    http::serve(gateway, &transport_config, &session_config, shutdown).await;
                if let Err(e) = &result {
                    warn!(error = %e, "HTTP transport stopped with error");
                }
                result
            })
        }
    }
}
