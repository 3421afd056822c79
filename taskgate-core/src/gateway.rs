//! Composition root and admission pipeline.
//!
//! [`Gateway`] owns one instance of every admission component. Each inbound
//! request runs through the same sequence regardless of transport:
//!
//! ```text
//! RequestContext ─▶ Authenticator ─▶ RateLimiter ─▶ RequestHandler ─▶ Upstream
//!        │                │                │               │
//!        └────────────────┴── GatewayError ┴───────────────┘
//!                                  │
//!                      JSON-RPC error envelope
//! ```
//!
//! Errors from any stage are caught once here and serialized with the
//! request id as correlation id. Internal detail only reaches the log.

use std::sync::Arc;
use std::time::Instant;

use prometheus_client::registry::Registry;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::auth::{Authenticator, UserContext};
use crate::clock::SystemClock;
use crate::config::{GatewayConfig, StoreBackend};
use crate::context::RequestContext;
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::handler::{RequestHandler, ToolHandler};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::lifecycle::{DrainResult, LifecycleManager, NotReady, Phase, StoreCheck};
use crate::ratelimit::RateLimiter;
use crate::session::{CloseReason, SessionManager};
use crate::store::{
    ConnectionManager, MemoryStore, RateLimitStore, RedisConnector, RedisStore, RetryPolicy,
};
use crate::telemetry::{GatewayMetrics, fingerprint};
use crate::upstream::UpstreamClient;

/// Components a [`Gateway`] is assembled from.
///
/// [`Gateway::from_config`] builds these for production; tests assemble
/// their own with fakes.
pub struct GatewayParts {
    pub authenticator: Arc<Authenticator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub handler: Arc<dyn RequestHandler>,
    pub sessions: Arc<SessionManager>,
    pub lifecycle: Arc<LifecycleManager>,
    pub metrics: Arc<GatewayMetrics>,
    pub store: Arc<dyn RateLimitStore>,
}

/// How often the store is rechecked for readiness.
const STORE_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Operational snapshot. Backs `/status` and, through `ready`, `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub version: &'static str,
    pub state: Phase,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_ready_reason: Option<NotReady>,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub active_requests: usize,
    pub auth_cache_entries: usize,
    pub store: StoreStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub backend: &'static str,
    /// Absent until the first check completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<StoreCheck>,
}

pub struct Gateway {
    authenticator: Arc<Authenticator>,
    rate_limiter: Arc<RateLimiter>,
    handler: Arc<dyn RequestHandler>,
    sessions: Arc<SessionManager>,
    lifecycle: Arc<LifecycleManager>,
    metrics: Arc<GatewayMetrics>,
    store: Arc<dyn RateLimitStore>,
    /// Present only for the Redis backend.
    connections: Option<Arc<ConnectionManager<RedisConnector>>>,
    /// Present only for the in-process backend.
    memory_store: Option<Arc<MemoryStore>>,
    session_cleanup_interval: std::time::Duration,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        Self {
            authenticator: parts.authenticator,
            rate_limiter: parts.rate_limiter,
            handler: parts.handler,
            sessions: parts.sessions,
            lifecycle: parts.lifecycle,
            metrics: parts.metrics,
            store: parts.store,
            connections: None,
            memory_store: None,
            session_cleanup_interval: std::time::Duration::from_secs(60),
        }
    }

    /// Build every component from validated configuration.
    ///
    /// Metrics are registered on `registry`. No network I/O happens here;
    /// the store connects lazily on first use.
    ///
    /// # Errors
    ///
    /// `Internal` if the upstream client or the store connector cannot be
    /// constructed.
    pub fn from_config(config: &GatewayConfig, registry: &mut Registry) -> GatewayResult<Self> {
        let metrics = Arc::new(GatewayMetrics::new(registry));

        let upstream = Arc::new(
            UpstreamClient::new(config.upstream.clone())?.with_metrics(Arc::clone(&metrics)),
        );

        let mut connections = None;
        let mut memory_store = None;
        let store: Arc<dyn RateLimitStore> = match config.store.backend {
            StoreBackend::Redis => {
                let connector = RedisConnector::new(&config.store.redis_url())?;
                let policy = RetryPolicy {
                    max_retries: config.store.max_retries,
                    base_delay: config.store.base_delay(),
                    max_delay: config.store.max_delay(),
                };
                let manager = Arc::new(
                    ConnectionManager::new(connector, policy).with_metrics(Arc::clone(&metrics)),
                );
                connections = Some(Arc::clone(&manager));
                Arc::new(RedisStore::new(manager))
            }
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                memory_store = Some(Arc::clone(&store));
                store
            }
        };

        let authenticator = Arc::new(
            Authenticator::new(upstream.clone(), config.auth.cache_ttl())
                .with_metrics(Arc::clone(&metrics)),
        );
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            &config.rate_limit,
        ));
        let sessions = Arc::new(
            SessionManager::new(config.session.idle_timeout()).with_metrics(Arc::clone(&metrics)),
        );
        let lifecycle = Arc::new(LifecycleManager::new(config.shutdown.drain_timeout()));
        let handler: Arc<dyn RequestHandler> = Arc::new(ToolHandler::new(upstream));

        info!(
            upstream = %config.upstream.api_base(),
            store = store.name(),
            transport = %config.transport.mode,
            "Gateway assembled"
        );

        let mut gateway = Self::new(GatewayParts {
            authenticator,
            rate_limiter,
            handler,
            sessions,
            lifecycle,
            metrics,
            store,
        });
        gateway.connections = connections;
        gateway.memory_store = memory_store;
        gateway.session_cleanup_interval = config.session.cleanup_interval();
        Ok(gateway)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    pub fn status(&self) -> GatewayStatus {
        let not_ready_reason = self.lifecycle.not_ready_reason();
        GatewayStatus {
            version: self.lifecycle.version(),
            state: self.lifecycle.phase(),
            ready: not_ready_reason.is_none(),
            not_ready_reason,
            uptime_seconds: self.lifecycle.uptime_seconds(),
            active_sessions: self.sessions.count(),
            active_requests: self.lifecycle.active_request_count(),
            auth_cache_entries: self.authenticator.cached_entries(),
            store: StoreStatus {
                backend: self.store.name(),
                last_check: self.lifecycle.last_store_check(),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup / shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Check the store, start background tasks, and mark the gateway ready.
    ///
    /// An unreachable store does not prevent startup; the gateway reports not
    /// ready and requests fail with `Internal` until a later check succeeds.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        self.lifecycle.mark_config_loaded();
        if !self.lifecycle.check_store(self.store.as_ref()).await {
            warn!(store = self.store.name(), "Rate-limit store unreachable at startup");
        }

        let shutdown = self.lifecycle.shutdown_token();
        let mut tasks = vec![
            self.lifecycle
                .spawn_store_monitor(Arc::clone(&self.store), STORE_CHECK_INTERVAL),
            self.sessions
                .spawn_idle_sweeper(self.session_cleanup_interval, shutdown.clone()),
        ];

        if let Some(memory) = &self.memory_store {
            let memory = Arc::clone(memory);
            let interval = self.session_cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let purged = memory.purge_expired();
                            if purged > 0 {
                                debug!(purged, "Purged expired rate-limit keys");
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }));
        }

        self.lifecycle.mark_ready();
        tasks
    }

    /// Graceful shutdown.
    ///
    /// Stops admitting requests, closes every session, waits for in-flight
    /// requests up to the drain timeout, then drops the store connection.
    ///
    /// A session admitted just before shutdown began registers while its
    /// request guard is held, so it is caught by the sweep after the drain.
    pub async fn shutdown(&self) -> DrainResult {
        self.lifecycle.begin_shutdown();

        let closed = self.sessions.close_all(CloseReason::Shutdown).await;
        info!(closed, "Sessions closed");

        let drain = self.lifecycle.drain().await;
        let late = self.sessions.close_all(CloseReason::Shutdown).await;
        if late > 0 {
            info!(closed = late, "Closed sessions opened during drain");
        }
        match &drain {
            DrainResult::Complete => info!("All in-flight requests completed"),
            DrainResult::Timeout { remaining } => {
                warn!(remaining, "Shutdown with requests still in flight")
            }
        }

        if let Some(connections) = &self.connections {
            connections.disconnect();
        }
        self.lifecycle.mark_stopped();
        drain
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one request through the pipeline.
    ///
    /// Returns `None` for notifications, which never get a response.
    pub async fn handle(
        &self,
        credential: Option<&str>,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> Option<JsonRpcResponse> {
        let span = ctx.span();
        let correlation_id = ctx.request_id.to_string();
        ctx.scope(
            self.dispatch(credential, request, correlation_id)
                .instrument(span),
        )
        .await
    }

    async fn dispatch(
        &self,
        credential: Option<&str>,
        request: JsonRpcRequest,
        correlation_id: String,
    ) -> Option<JsonRpcResponse> {
        let started = Instant::now();
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let notification = id.is_none();
        let method_label = metric_method(&method);

        let result = match self.lifecycle.track_request() {
            Some(_guard) => self.run(credential, &method, params, notification).await,
            None => Err(GatewayError::internal("Gateway is shutting down")),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(result) => {
                self.metrics
                    .record_request(method_label, "success", elapsed_ms);
                debug!(method = %method, elapsed_ms, "Request completed");
                result.map(|value| JsonRpcResponse::success(id, value))
            }
            Err(err) => {
                self.metrics
                    .record_request(method_label, err.kind().as_str(), elapsed_ms);
                log_failure(&err, &method, &correlation_id);
                if notification {
                    return None;
                }
                Some(JsonRpcResponse::error(
                    id,
                    err.to_jsonrpc_error(&correlation_id),
                ))
            }
        }
    }

    /// Admission then dispatch. `Ok(None)` for an admitted notification.
    async fn run(
        &self,
        credential: Option<&str>,
        method: &str,
        params: Option<Value>,
        notification: bool,
    ) -> GatewayResult<Option<Value>> {
        let user = self.admit(credential).await?;
        if notification {
            debug!(method, "Notification accepted");
            return Ok(None);
        }
        let value = self.handler.handle(&user, method, params).await?;
        Ok(Some(value))
    }

    /// Authenticate, then charge the caller's rate-limit window.
    ///
    /// # Errors
    ///
    /// `Authentication` for a missing or rejected credential, `RateLimit`
    /// when the window is full, `Internal` when the store is unavailable.
    pub async fn admit(&self, credential: Option<&str>) -> GatewayResult<Arc<UserContext>> {
        let result = self.admit_inner(credential).await;
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorKind::Authentication | ErrorKind::RateLimit) {
                self.metrics.record_rejection(err.kind().as_str());
            }
        }
        result
    }

    async fn admit_inner(&self, credential: Option<&str>) -> GatewayResult<Arc<UserContext>> {
        let credential = credential
            .ok_or_else(|| GatewayError::authentication("Missing bearer credential"))?;
        let user = self.authenticator.validate(credential).await?;
        self.rate_limiter.check_limit(credential).await?;
        debug!(
            user_id = user.user_id,
            token = %fingerprint(credential),
            "Request admitted"
        );
        Ok(user)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("store", &self.store.name())
            .field("sessions", &self.sessions.count())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// Bound metric label cardinality to the methods we serve.
fn metric_method(method: &str) -> &'static str {
    match method {
        "initialize" => "initialize",
        "ping" => "ping",
        "tools/list" => "tools/list",
        "tools/call" => "tools/call",
        m if m.starts_with("notifications/") => "notification",
        _ => "other",
    }
}

fn log_failure(err: &GatewayError, method: &str, correlation_id: &str) {
    match err.kind() {
        ErrorKind::Internal => error!(
            method,
            correlation_id,
            error = %err,
            details = ?err.details(),
            "Request failed"
        ),
        ErrorKind::RateLimit => warn!(
            method,
            retry_after = err.retry_after(),
            "Request rate limited"
        ),
        kind => warn!(method, kind = %kind, error = %err, "Request rejected"),
    }
}
