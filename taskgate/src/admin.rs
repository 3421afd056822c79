//! Admin server for health checks, status and metrics.
//!
//! Runs on its own port (default: 7469), apart from the transport port, so
//! health checks and scrapes never compete with client traffic and never need a
//! credential.
//!
//! - `GET /health` - liveness; 503 only once stopped
//! - `GET /ready` - the status snapshot, 200 when ready and 503 otherwise
//! - `GET /status` - the status snapshot, always 200
//! - `GET /metrics` - OpenMetrics text

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskgate_core::Gateway;
use taskgate_core::lifecycle::Phase;

use crate::error::ServeError;

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<Registry>,
}

pub struct AdminServer {
    bind_addr: String,
    state: AdminState,
}

impl AdminServer {
    pub fn new(gateway: Arc<Gateway>, registry: Arc<Registry>, bind: &str, port: u16) -> Self {
        Self {
            bind_addr: format!("{bind}:{port}"),
            state: AdminState { gateway, registry },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// `Bind` if the port is taken, `Io` if serving fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServeError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;

        info!(addr = %self.bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Liveness {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let lifecycle = state.gateway.lifecycle();
    let (code, status) = match lifecycle.phase() {
        Phase::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        _ => (StatusCode::OK, "healthy"),
    };
    (
        code,
        Json(Liveness {
            status,
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
        }),
    )
}

async fn ready_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.gateway.status();
    let code = if status.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn status_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.gateway.status())
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use taskgate_core::config::{GatewayConfig, StoreBackend};
    use tower::ServiceExt;

    fn admin() -> AdminServer {
        let mut config = GatewayConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.upstream.base_url = "http://127.0.0.1:9".into();
        let mut registry = Registry::default();
        let gateway = Gateway::from_config(&config, &mut registry).unwrap();
        AdminServer::new(Arc::new(gateway), Arc::new(registry), "127.0.0.1", 0)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = get_json(admin().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_ready_before_start_is_unavailable() {
        let (status, json) = get_json(admin().router(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["ready"], false);
        assert_eq!(json["not_ready_reason"], "starting");
    }

    #[tokio::test]
    async fn test_ready_after_start_then_shutdown() {
        let admin = admin();
        let tasks = admin.state.gateway.start().await;
        let (status, json) = get_json(admin.router(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ready"], true);
        assert_eq!(json["store"]["last_check"]["reachable"], true);
        assert!(json.get("not_ready_reason").is_none());

        admin.state.gateway.shutdown().await;
        let (status, json) = get_json(admin.router(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["not_ready_reason"], "shutting_down");

        let (status, json) = get_json(admin.router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "stopped");
        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (status, json) = get_json(admin().router(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["store"]["backend"], "memory");
        assert!(json["store"].get("last_check").is_none());
        assert_eq!(json["active_sessions"], 0);
        assert_eq!(json["state"], "starting");
        assert_eq!(json["ready"], false);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = admin()
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("application/openmetrics-text"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# EOF"));
    }
}
