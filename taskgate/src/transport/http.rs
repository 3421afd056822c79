//! Streamable HTTP and SSE transports.
//!
//! # Endpoints
//!
//! - `POST /mcp` - one JSON-RPC request per body, answered in the response.
//! - `GET /sse` - opens a session. The first event is `endpoint`, naming
//!   the URL to post messages to.
//! - `POST /messages?sessionId=...` - a request for an open SSE session.
//!   Answered `202 Accepted`; the JSON-RPC response arrives on the stream.
//!
//! Credentials come from `Authorization: Bearer`. Browsers cannot set
//! headers on `EventSource`, so `/sse` also accepts `?token=`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, warn};

use taskgate_core::Gateway;
use taskgate_core::auth::bearer_token;
use taskgate_core::config::{SessionConfig, TransportConfig};
use taskgate_core::context::{RequestContext, TransportKind};
use taskgate_core::error::{ErrorKind, GatewayError};
use taskgate_core::jsonrpc::{JsonRpcRequest, JsonRpcResponse, ProtocolError};
use taskgate_core::session::{
    CloseReason, Session, SessionId, SessionManager, SessionTransport, TransportError,
};

use crate::error::ServeError;

/// Upper bound on how long a slow SSE reader may hold up a send.
const SSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct HttpState {
    gateway: Arc<Gateway>,
    channel_capacity: usize,
}

/// Build the transport router.
pub fn router(gateway: Arc<Gateway>, transport: &TransportConfig, session: &SessionConfig) -> Router {
    let state = HttpState {
        gateway,
        channel_capacity: session.channel_capacity.max(1),
    };
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .layer(DefaultBodyLimit::max(transport.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` is cancelled.
///
/// Open SSE streams keep the server alive until their sessions are closed,
/// so callers should run `Gateway::shutdown` after cancelling.
///
/// # Errors
///
/// `Bind` if the listen address is unavailable, `Io` if serving fails.
pub async fn serve(
    gateway: Arc<Gateway>,
    transport: &TransportConfig,
    session: &SessionConfig,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    let port = transport.port.unwrap_or_default();
    let addr = format!("{}:{}", transport.bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr = %addr, "HTTP transport listening");

    axum::serve(listener, router(gateway, transport, session))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP transport shutting down");
        })
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn mcp_handler(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let request = match JsonRpcRequest::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return protocol_error(&e),
    };
    let credential = credential_from_headers(&headers);
    let ctx = RequestContext::new(TransportKind::Http, None);

    match state.gateway.handle(credential, request, ctx).await {
        Some(response) => rpc_response(response),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    token: Option<String>,
}

async fn sse_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Response {
    let credential = credential_from_headers(&headers).or(query.token.as_deref());
    let ctx = RequestContext::new(TransportKind::Sse, None);
    let correlation_id = ctx.request_id.to_string();

    // Held until the session is registered so shutdown's drain covers it.
    let Some(_guard) = state.gateway.lifecycle().track_request() else {
        debug!("SSE connection refused during shutdown");
        let err = GatewayError::internal("Gateway is shutting down");
        return gateway_error(&err, &correlation_id);
    };

    let span = ctx.span();
    let admitted = ctx.scope(state.gateway.admit(credential).instrument(span));
    let user = match admitted.await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "SSE connection rejected");
            return gateway_error(&e, &correlation_id);
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(state.channel_capacity);
    let id = SessionId::new();
    let sessions = Arc::clone(state.gateway.sessions());
    sessions.add(Session::new(
        id.clone(),
        user,
        Arc::new(SseTransport { tx }),
    ));

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={id}"));
    let guard = DisconnectGuard { id, sessions };

    Sse::new(session_stream(endpoint, rx, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// The endpoint event, then whatever the session sends, until the sender
/// side is dropped. Dropping the stream drops the guard.
fn session_stream(
    endpoint: Event,
    rx: mpsc::Receiver<Event>,
    guard: DisconnectGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::once(async move { endpoint })
        .chain(ReceiverStream::new(rx))
        .map(move |event| {
            let _ = &guard;
            Ok(event)
        })
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn messages_handler(
    State(state): State<HttpState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Response {
    let id = SessionId::from(query.session_id.as_str());
    let sessions = Arc::clone(state.gateway.sessions());

    let Some(user) = sessions.user(&id) else {
        let ctx = RequestContext::new(TransportKind::Sse, None);
        let err = GatewayError::not_found("Unknown or closed session");
        return gateway_error(&err, &ctx.request_id.to_string());
    };
    sessions.touch(&id);

    let request = match JsonRpcRequest::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return protocol_error(&e),
    };

    let gateway = Arc::clone(&state.gateway);
    tokio::spawn(async move {
        let ctx = RequestContext::new(TransportKind::Sse, Some(id.clone()));
        let Some(response) = gateway.handle(Some(&user.token), request, ctx).await else {
            return;
        };
        let message = match serde_json::to_value(&response) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to serialize response");
                return;
            }
        };
        if let Err(e) = gateway.sessions().send(&id, &message).await {
            debug!(session_id = %id, error = %e, "Discarding response for closed session");
        }
    });

    StatusCode::ACCEPTED.into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE session transport
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound half of an SSE connection.
///
/// Owned by the session registry. When the session is removed this is
/// dropped, the channel closes, and the stream ends.
struct SseTransport {
    tx: mpsc::Sender<Event>,
}

impl SseTransport {
    async fn push(&self, event: Event) -> Result<(), TransportError> {
        self.tx
            .send_timeout(event, SSE_SEND_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Closed(_) => TransportError::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    TransportError::Send("client not reading".to_string())
                }
            })
    }
}

#[async_trait]
impl SessionTransport for SseTransport {
    async fn send(&self, message: &serde_json::Value) -> Result<(), TransportError> {
        let event = Event::default()
            .event("message")
            .json_data(message)
            .map_err(|e| TransportError::Send(e.to_string()))?;
        self.push(event).await
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        self.push(Event::default().event("close").data(reason.as_str()))
            .await
    }
}

/// Closes the session when the client goes away.
struct DisconnectGuard {
    id: SessionId,
    sessions: Arc<SessionManager>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = self.id.clone();
        let sessions = Arc::clone(&self.sessions);
        handle.spawn(async move {
            // False when the server closed it first.
            if sessions.close(&id, CloseReason::ClientDisconnect).await {
                debug!(session_id = %id, "SSE client disconnected");
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn credential_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
}

/// HTTP status for a JSON-RPC response: 200 on success, otherwise derived
/// from the error kind. Rate-limit errors carry `Retry-After`.
fn rpc_response(response: JsonRpcResponse) -> Response {
    let Some(error) = &response.error else {
        return (StatusCode::OK, Json(response)).into_response();
    };
    let status = ErrorKind::from_code(error.code)
        .and_then(|kind| StatusCode::from_u16(kind.http_status()).ok())
        .unwrap_or(StatusCode::BAD_REQUEST);
    let retry_after = error.data.as_ref().and_then(|d| d.retry_after);

    let mut http = (status, Json(response)).into_response();
    if let Some(secs) = retry_after {
        http.headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    http
}

fn gateway_error(err: &GatewayError, correlation_id: &str) -> Response {
    rpc_response(JsonRpcResponse::error(
        None,
        err.to_jsonrpc_error(correlation_id),
    ))
}

fn protocol_error(err: &ProtocolError) -> Response {
    debug!(error = %err, "Rejected malformed JSON-RPC body");
    (StatusCode::BAD_REQUEST, Json(err.to_response())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;
    use taskgate_core::jsonrpc::JsonRpcId;

    #[test]
    fn test_credential_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(credential_from_headers(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(credential_from_headers(&headers), Some("tok-1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(credential_from_headers(&headers), None);
    }

    #[tokio::test]
    async fn test_rate_limit_response_sets_retry_after() {
        let reset_at = chrono::Utc::now() + chrono::Duration::seconds(30);
        let err = GatewayError::rate_limit(0, reset_at);
        let response = gateway_error(&err, "corr-1");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["data"]["correlation_id"], "corr-1");
    }

    #[tokio::test]
    async fn test_success_response_is_ok() {
        let response = rpc_response(JsonRpcResponse::success(
            Some(JsonRpcId::Number(1)),
            json!({}),
        ));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_status() {
        let cases = [
            (GatewayError::authentication("no"), StatusCode::UNAUTHORIZED),
            (GatewayError::permission("no"), StatusCode::FORBIDDEN),
            (GatewayError::not_found("no"), StatusCode::NOT_FOUND),
            (GatewayError::validation("no"), StatusCode::UNPROCESSABLE_ENTITY),
            (GatewayError::internal("no"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(gateway_error(&err, "c").status(), status, "{err}");
        }
    }

    #[tokio::test]
    async fn test_protocol_error_is_bad_request() {
        let response = protocol_error(&ProtocolError::Parse("EOF".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_session_stream_starts_with_endpoint_and_ends_when_sender_drops() {
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(60)));
        let (tx, rx) = mpsc::channel(4);
        let guard = DisconnectGuard {
            id: SessionId::from("s-1"),
            sessions,
        };
        let transport = SseTransport { tx };
        transport.send(&json!({"ok": true})).await.unwrap();
        transport.close(CloseReason::Shutdown).await.unwrap();
        drop(transport);

        let endpoint = Event::default().event("endpoint").data("/messages?sessionId=s-1");
        let events: Vec<_> = session_stream(endpoint, rx, guard).collect().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_sse_transport_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let transport = SseTransport { tx };
        assert_eq!(
            transport.send(&json!({})).await,
            Err(TransportError::Closed)
        );
    }
}
