//! Request context propagation.
//!
//! A [`RequestContext`] is installed as a tokio task-local for the duration
//! of one inbound request. Anything running inside that scope, at any call
//! depth, can read it with [`RequestContext::current`] without it being
//! threaded through signatures. Spawned tasks do not inherit task-locals;
//! use [`spawn_in_context`] to carry the context across.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::Span;
use uuid::Uuid;

use crate::session::SessionId;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Which inbound transport carried the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

/// Identity of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub session_id: Option<SessionId>,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(transport: TransportKind, session_id: Option<SessionId>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_id,
            transport,
            started_at: Utc::now(),
        }
    }

    /// The context of the request being handled by this task, if any.
    pub fn current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(Clone::clone).ok()
    }

    /// The current request id as a string, for headers and correlation.
    pub fn current_request_id() -> Option<String> {
        REQUEST_CONTEXT
            .try_with(|ctx| ctx.request_id.to_string())
            .ok()
    }

    /// Run `fut` with this context installed.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        REQUEST_CONTEXT.scope(self, fut).await
    }

    /// A tracing span carrying the request and session ids.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            session_id = self.session_id.as_ref().map(|s| s.as_str()),
            transport = self.transport.as_str(),
        )
    }
}

/// Spawn a task that sees the caller's request context.
///
/// Outside a request scope this is a plain `tokio::spawn`.
pub fn spawn_in_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match RequestContext::current() {
        Some(ctx) => tokio::spawn(REQUEST_CONTEXT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}
