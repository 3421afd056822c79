//! Session registry for long-lived client connections.
//!
//! # State machine
//!
//! ```text
//! connected ──(idle timeout | client disconnect | shutdown)──▶ closing
//! closing   ──(close notification attempted)────────────────▶ closed
//! closed    ──(removed from registry)
//! ```
//!
//! The manager is the only owner of each session's transport handle. Readers
//! get a [`SessionInfo`] snapshot. Close notifications are best-effort: a
//! failure is logged and the session is torn down anyway.
//!
//! A request still in flight when its session moves to `closing` is allowed
//! to finish; its response is discarded by [`SessionManager::send`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::UserContext;
use crate::telemetry::GatewayMetrics;

// ============================================================================
// Identifiers and states
// ============================================================================

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().simple().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Closing,
    Closed,
}

/// Why a session is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    ClientDisconnect,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::ClientDisconnect => "client_disconnect",
            Self::Shutdown => "shutdown",
        }
    }
}

// ============================================================================
// Transport handle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer is gone.
    #[error("transport closed")]
    Closed,

    #[error("transport send failed: {0}")]
    Send(String),
}

/// Outbound half of a client connection.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Deliver one JSON-RPC message to the client.
    async fn send(&self, message: &serde_json::Value) -> Result<(), TransportError>;

    /// Notify the client that the session is ending and release the
    /// connection. Called at most once per session.
    async fn close(&self, reason: CloseReason) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} is closing")]
    NotConnected(SessionId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Sessions
// ============================================================================

/// A registered session. Owned by the [`SessionManager`].
pub struct Session {
    id: SessionId,
    user: Arc<UserContext>,
    transport: Arc<dyn SessionTransport>,
    connected_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId, user: Arc<UserContext>, transport: Arc<dyn SessionTransport>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user,
            transport,
            connected_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            state: SessionState::Connected,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            user_id: self.user.user_id,
            username: self.user.username.clone(),
            connected_at: self.connected_at,
            last_activity_at: self.last_activity_at,
            state: self.state,
        }
    }
}

/// Read-only snapshot of a session, without the transport handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_id: i64,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
}

/// A disconnected client cannot receive its own close event.
fn peer_already_gone(reason: CloseReason, error: &TransportError) -> bool {
    reason == CloseReason::ClientDisconnect && *error == TransportError::Closed
}

// ============================================================================
// Manager
// ============================================================================

pub struct SessionManager {
    sessions: DashMap<SessionId, Session>,
    idle_timeout: Duration,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.set_active_sessions(self.sessions.len());
        }
    }

    /// Register a session.
    pub fn add(&self, session: Session) -> SessionId {
        let id = session.id.clone();
        info!(
            session_id = %id,
            user_id = session.user.user_id,
            "Session opened"
        );
        self.sessions.insert(id.clone(), session);
        self.update_gauge();
        id
    }

    /// Drop a session from the registry without notifying its transport.
    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        let removed = self.sessions.remove(id).map(|(_, s)| s.info());
        if removed.is_some() {
            debug!(session_id = %id, "Session removed");
            self.update_gauge();
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.info())
    }

    pub fn get_all(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// The authenticated user of a connected session.
    pub fn user(&self, id: &SessionId) -> Option<Arc<UserContext>> {
        self.sessions
            .get(id)
            .filter(|s| s.state == SessionState::Connected)
            .map(|s| Arc::clone(&s.user))
    }

    /// Record activity on a session. Returns false if it is not connected.
    pub fn touch(&self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) if s.state == SessionState::Connected => {
                s.last_activity = Instant::now();
                s.last_activity_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Deliver a message to a connected session.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotConnected` when the session is gone or closing; the
    /// caller discards the message.
    pub async fn send(&self, id: &SessionId, message: &serde_json::Value) -> Result<(), SessionError> {
        let transport = {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if session.state != SessionState::Connected {
                return Err(SessionError::NotConnected(id.clone()));
            }
            Arc::clone(&session.transport)
        };
        transport.send(message).await?;
        Ok(())
    }

    /// Move a connected session to `closing` and return its transport.
    fn begin_close(&self, id: &SessionId) -> Option<Arc<dyn SessionTransport>> {
        let mut session = self.sessions.get_mut(id)?;
        if session.state != SessionState::Connected {
            return None;
        }
        session.state = SessionState::Closing;
        Some(Arc::clone(&session.transport))
    }

    fn finish_close(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.state = SessionState::Closed;
        }
        self.remove(id);
    }

    async fn notify(id: &SessionId, transport: Arc<dyn SessionTransport>, reason: CloseReason) {
        match transport.close(reason).await {
            Ok(()) => {}
            Err(e) if peer_already_gone(reason, &e) => {
                debug!(session_id = %id, "Client left before close notification");
            }
            Err(e) => {
                warn!(
                    session_id = %id,
                    reason = reason.as_str(),
                    error = %e,
                    "Close notification failed"
                );
            }
        }
    }

    /// Close one session. Returns false if it was not connected.
    pub async fn close(&self, id: &SessionId, reason: CloseReason) -> bool {
        let Some(transport) = self.begin_close(id) else {
            return false;
        };
        Self::notify(id, transport, reason).await;
        self.finish_close(id);
        info!(session_id = %id, reason = reason.as_str(), "Session closed");
        true
    }

    /// Close every connected session concurrently.
    ///
    /// Each transport receives exactly one close notification. Failures are
    /// logged, never returned. Returns once every session has been torn down
    /// and removed.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id.clone()).collect();
        let closing: Vec<(SessionId, Arc<dyn SessionTransport>)> = ids
            .into_iter()
            .filter_map(|id| self.begin_close(&id).map(|t| (id, t)))
            .collect();

        let count = closing.len();
        if count == 0 {
            return 0;
        }
        info!(count, reason = reason.as_str(), "Closing all sessions");

        join_all(
            closing
                .iter()
                .map(|(id, transport)| Self::notify(id, Arc::clone(transport), reason)),
        )
        .await;

        for (id, _) in &closing {
            self.finish_close(id);
        }
        info!(count, remaining = self.count(), "All sessions closed");
        count
    }

    /// Close every session idle for longer than the idle timeout.
    pub async fn sweep_idle(&self) -> usize {
        let cutoff = self.idle_timeout;
        let now = Instant::now();
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| {
                s.state == SessionState::Connected && now.duration_since(s.last_activity) > cutoff
            })
            .map(|s| s.id.clone())
            .collect();

        let closed = join_all(idle.iter().map(|id| self.close(id, CloseReason::IdleTimeout)))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        if closed > 0 {
            debug!(closed, remaining = self.count(), "Closed idle sessions");
        }
        closed
    }

    /// Spawn a background task that closes idle sessions every `interval`.
    ///
    /// The task stops when the cancellation token is triggered.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        manager.sweep_idle().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
