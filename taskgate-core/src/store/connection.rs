//! Singleton store connection with single-flight connect.
//!
//! The connection is an explicit state machine under a mutex:
//!
//! ```text
//! Unconnected ──get_connection()──▶ Connecting(shared future)
//!      ▲                                 │
//!      │ failure / disconnect()          │ success
//!      └─────────────────────────────────┤
//!                                        ▼
//!                                    Connected(conn)
//! ```
//!
//! Concurrent callers during `Connecting` await the same shared future, so
//! at most one connect attempt sequence is ever in flight. A failed sequence
//! resets the state to `Unconnected` and a later call starts over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::StoreError;
use crate::telemetry::GatewayMetrics;

/// Opens and pings connections to the backing store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A cheaply cloneable (multiplexed) connection handle.
    type Connection: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    async fn ping(&self, connection: &Self::Connection) -> Result<(), StoreError>;
}

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connect attempts before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Delay after failed attempt `attempt` (1-based): `attempt × base`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(attempt).min(max)
}

type PendingConnect<T> = Shared<BoxFuture<'static, Result<T, StoreError>>>;

enum ConnState<T> {
    Unconnected,
    Connecting { id: u64, pending: PendingConnect<T> },
    Connected(T),
}

/// Owns the single shared connection to the store.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    policy: RetryPolicy,
    state: Mutex<ConnState<C::Connection>>,
    next_id: AtomicU64,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            policy,
            state: Mutex::new(ConnState::Unconnected),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Return the live connection, joining or starting a connect if needed.
    ///
    /// # Errors
    ///
    /// `StoreError::RetriesExhausted` once the retry ceiling is reached.
    pub async fn get_connection(&self) -> Result<C::Connection, StoreError> {
        let (id, pending) = {
            let mut state = self.state.lock();
            match &*state {
                ConnState::Connected(conn) => return Ok(conn.clone()),
                ConnState::Connecting { id, pending } => (*id, pending.clone()),
                ConnState::Unconnected => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let pending = connect_with_retry(
                        Arc::clone(&self.connector),
                        self.policy.clone(),
                        self.metrics.clone(),
                    )
                    .boxed()
                    .shared();
                    *state = ConnState::Connecting {
                        id,
                        pending: pending.clone(),
                    };
                    (id, pending)
                }
            }
        };

        let result = pending.await;

        let mut state = self.state.lock();
        // Only the attempt that is still current may publish its outcome; a
        // disconnect() in the meantime wins.
        if matches!(&*state, ConnState::Connecting { id: current, .. } if *current == id) {
            *state = match &result {
                Ok(conn) => ConnState::Connected(conn.clone()),
                Err(_) => ConnState::Unconnected,
            };
        }
        result
    }

    /// Tear down the singleton. The next `get_connection` reconnects.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnState::Unconnected);
        if matches!(previous, ConnState::Connected(_)) {
            info!("Store connection closed");
        }
    }

    /// Run `op` on the live connection. A failure that means the connection
    /// broke tears it down, so the next call redials instead of reusing it.
    ///
    /// # Errors
    ///
    /// Whatever `get_connection` or `op` returns.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(C::Connection) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let conn = self.get_connection().await?;
        let result = op(conn).await;
        if let Err(e) = &result
            && e.is_connection_lost()
        {
            warn!(error = %e, "Store connection lost, reconnecting on next use");
            self.disconnect();
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.lock(), ConnState::Connected(_))
    }

    /// Liveness check: connect if needed, then PING.
    pub async fn is_healthy(&self) -> bool {
        let conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "Store health check: no connection");
                return false;
            }
        };
        match self.connector.ping(&conn).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Store health check: PING failed");
                // Drop the broken handle so the next call reconnects
                self.disconnect();
                false
            }
        }
    }
}

async fn connect_with_retry<C: Connector>(
    connector: Arc<C>,
    policy: RetryPolicy,
    metrics: Option<Arc<GatewayMetrics>>,
) -> Result<C::Connection, StoreError> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_retries {
        match connector.connect().await {
            Ok(conn) => {
                if let Some(m) = &metrics {
                    m.record_store_connect(true);
                }
                info!(attempt, "Store connection established");
                return Ok(conn);
            }
            Err(e) => {
                if let Some(m) = &metrics {
                    m.record_store_connect(false);
                }
                last_error = e.to_string();
                if attempt < policy.max_retries {
                    let delay = backoff_delay(attempt, policy.base_delay, policy.max_delay);
                    warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    warn!(
        attempts = policy.max_retries,
        error = %last_error,
        "Store connect failed, giving up"
    );
    Err(StoreError::RetriesExhausted {
        attempts: policy.max_retries,
        last_error,
    })
}

// ============================================================================
// Redis
// ============================================================================

/// [`Connector`] for a Redis server, yielding a multiplexed connection.
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Parse the URL. Nothing is dialed until the first `connect`.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection {
            message: e.to_string(),
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = redis::aio::MultiplexedConnection;

    async fn connect(&self) -> Result<Self::Connection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection {
                message: e.to_string(),
            })
    }

    async fn ping(&self, connection: &Self::Connection) -> Result<(), StoreError> {
        let mut conn = connection.clone();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command {
                command: "PING",
                message: e.to_string(),
            })?;
        Ok(())
    }
}
