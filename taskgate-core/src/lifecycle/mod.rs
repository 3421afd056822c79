//! Process phase, in-flight request accounting, and store reachability.
//!
//! ```text
//! Starting ──start()──▶ Ready ──begin_shutdown()──▶ ShuttingDown ──▶ Stopped
//! ```
//!
//! The phase and the in-flight count live in one `watch` cell so that
//! admitting a request and entering `ShuttingDown` are ordered against each
//! other: once `begin_shutdown` returns, no new [`RequestGuard`] can be
//! issued, and [`LifecycleManager::drain`] wakes on the last guard drop
//! instead of polling.
//!
//! Readiness is derived, never stored: the gateway is ready when it is in
//! `Ready`, configuration has been loaded, and the most recent store check
//! succeeded. A failing check flips readiness without touching the phase.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::RateLimitStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    fn admits(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Gate {
    phase: Phase,
    in_flight: usize,
}

/// Outcome of the most recent store check.
#[derive(Debug, Clone, Serialize)]
pub struct StoreCheck {
    pub reachable: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why the gateway should not receive traffic, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReady {
    Starting,
    ConfigNotLoaded,
    StoreNotChecked,
    StoreUnreachable,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

pub struct LifecycleManager {
    gate: watch::Sender<Gate>,
    config_loaded: AtomicBool,
    store: ArcSwapOption<StoreCheck>,
    shutdown: CancellationToken,
    started_at: Instant,
    drain_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(drain_timeout: Duration) -> Self {
        let (gate, _) = watch::channel(Gate {
            phase: Phase::Starting,
            in_flight: 0,
        });
        Self {
            gate,
            config_loaded: AtomicBool::new(false),
            store: ArcSwapOption::empty(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            drain_timeout,
        }
    }

    pub fn phase(&self) -> Phase {
        self.gate.borrow().phase
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.phase().admits()
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_request_count(&self) -> usize {
        self.gate.borrow().in_flight
    }

    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::SeqCst);
    }

    /// Starting → Ready. No effect once shutdown has begun.
    pub fn mark_ready(&self) {
        let moved = self.gate.send_if_modified(|gate| {
            if gate.phase != Phase::Starting {
                return false;
            }
            gate.phase = Phase::Ready;
            true
        });
        if moved {
            info!(
                version = self.version(),
                startup_ms = self.started_at.elapsed().as_millis() as u64,
                "TaskGate ready"
            );
        }
    }

    /// Stop issuing request guards and cancel the shutdown token.
    pub fn begin_shutdown(&self) {
        self.gate.send_modify(|gate| {
            if gate.phase.admits() {
                gate.phase = Phase::ShuttingDown;
            }
        });
        self.shutdown.cancel();
        info!(in_flight = self.active_request_count(), "Shutdown initiated");
    }

    pub fn mark_stopped(&self) {
        self.gate.send_modify(|gate| gate.phase = Phase::Stopped);
    }

    /// Count a request as in flight until the guard drops.
    ///
    /// `None` once shutdown has begun; the caller refuses the request.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        let admitted = self.gate.send_if_modified(|gate| {
            if !gate.phase.admits() {
                return false;
            }
            gate.in_flight += 1;
            true
        });
        admitted.then(|| RequestGuard {
            lifecycle: Arc::clone(self),
        })
    }

    /// Wait until every guard has dropped or the drain timeout passes.
    pub async fn drain(&self) -> DrainResult {
        let mut rx = self.gate.subscribe();
        let idle = tokio::time::timeout(self.drain_timeout, rx.wait_for(|g| g.in_flight == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        if idle {
            return DrainResult::Complete;
        }
        let remaining = self.active_request_count();
        warn!(remaining, "Drain timeout exceeded");
        DrainResult::Timeout { remaining }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Store reachability
    // ─────────────────────────────────────────────────────────────────────────

    pub fn last_store_check(&self) -> Option<StoreCheck> {
        self.store.load_full().map(|p| (*p).clone())
    }

    /// Record a check result, logging only when reachability changes.
    pub fn record_store_check(&self, result: Result<(), String>) {
        let reachable = result.is_ok();
        let previous = self.store.swap(Some(Arc::new(StoreCheck {
            reachable,
            checked_at: Utc::now(),
            error: result.err(),
        })));
        match previous.map(|p| p.reachable) {
            Some(was) if was == reachable => {}
            _ if reachable => info!("Rate-limit store reachable"),
            _ => warn!("Rate-limit store unreachable, reporting not ready"),
        }
    }

    /// Ping the store once and record the outcome.
    pub async fn check_store(&self, store: &dyn RateLimitStore) -> bool {
        let result = store.ping().await.map_err(|e| {
            debug!(store = store.name(), error = %e, "Store check failed");
            e.to_string()
        });
        let reachable = result.is_ok();
        self.record_store_check(result);
        reachable
    }

    /// Re-check the store every `interval` until shutdown.
    pub fn spawn_store_monitor(
        self: &Arc<Self>,
        store: Arc<dyn RateLimitStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        lifecycle.check_store(store.as_ref()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Readiness
    // ─────────────────────────────────────────────────────────────────────────

    /// First reason the gateway is not ready, or `None` when it is.
    pub fn not_ready_reason(&self) -> Option<NotReady> {
        match self.phase() {
            Phase::Starting => return Some(NotReady::Starting),
            Phase::ShuttingDown | Phase::Stopped => return Some(NotReady::ShuttingDown),
            Phase::Ready => {}
        }
        if !self.config_loaded.load(Ordering::SeqCst) {
            return Some(NotReady::ConfigNotLoaded);
        }
        match self.store.load().as_deref() {
            None => Some(NotReady::StoreNotChecked),
            Some(check) if !check.reachable => Some(NotReady::StoreUnreachable),
            Some(_) => None,
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gate = *self.gate.borrow();
        f.debug_struct("LifecycleManager")
            .field("phase", &gate.phase)
            .field("in_flight", &gate.in_flight)
            .finish_non_exhaustive()
    }
}

/// Holds one slot in the in-flight count. Movable into spawned tasks.
pub struct RequestGuard {
    lifecycle: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle
            .gate
            .send_modify(|gate| gate.in_flight = gate.in_flight.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn lifecycle() -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(Duration::from_secs(5)))
    }

    /// Store whose every call fails.
    struct DownStore;

    fn refused() -> StoreError {
        StoreError::Connection {
            message: "connection refused".into(),
        }
    }

    #[async_trait]
    impl RateLimitStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(refused())
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(refused())
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(refused())
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(refused())
        }
        async fn zadd(&self, _: &str, _: i64, _: &str) -> Result<(), StoreError> {
            Err(refused())
        }
        async fn zremrangebyscore(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
            Err(refused())
        }
        async fn zcard(&self, _: &str) -> Result<u64, StoreError> {
            Err(refused())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(refused())
        }
    }

    #[test]
    fn test_phase_transitions() {
        let lc = lifecycle();
        assert_eq!(lc.phase(), Phase::Starting);

        lc.mark_ready();
        assert_eq!(lc.phase(), Phase::Ready);

        lc.begin_shutdown();
        assert_eq!(lc.phase(), Phase::ShuttingDown);
        assert!(lc.shutdown_token().is_cancelled());

        // Too late to become ready again
        lc.mark_ready();
        assert_eq!(lc.phase(), Phase::ShuttingDown);

        lc.mark_stopped();
        assert!(lc.is_shutting_down());
    }

    #[test]
    fn test_guards_are_counted_and_refused_after_shutdown() {
        let lc = lifecycle();
        let a = lc.track_request().unwrap();
        let b = lc.track_request().unwrap();
        assert_eq!(lc.active_request_count(), 2);
        drop(a);
        assert_eq!(lc.active_request_count(), 1);

        lc.begin_shutdown();
        assert!(lc.track_request().is_none());
        assert_eq!(lc.active_request_count(), 1);
        drop(b);
        assert_eq!(lc.active_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_wakes_on_last_guard() {
        let lc = lifecycle();
        let guard = lc.track_request().unwrap();
        lc.begin_shutdown();

        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            drop(guard);
        });

        assert_eq!(lc.drain().await, DrainResult::Complete);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_with_remaining_count() {
        let lc = Arc::new(LifecycleManager::new(Duration::from_secs(1)));
        let _guard = lc.track_request().unwrap();
        lc.begin_shutdown();
        assert_eq!(lc.drain().await, DrainResult::Timeout { remaining: 1 });
    }

    #[tokio::test]
    async fn test_readiness_follows_last_store_check() {
        let lc = lifecycle();
        assert_eq!(lc.not_ready_reason(), Some(NotReady::Starting));

        lc.mark_ready();
        assert_eq!(lc.not_ready_reason(), Some(NotReady::ConfigNotLoaded));

        lc.mark_config_loaded();
        assert_eq!(lc.not_ready_reason(), Some(NotReady::StoreNotChecked));

        assert!(lc.check_store(&MemoryStore::new()).await);
        assert_eq!(lc.not_ready_reason(), None);

        assert!(!lc.check_store(&DownStore).await);
        assert_eq!(lc.not_ready_reason(), Some(NotReady::StoreUnreachable));
        let check = lc.last_store_check().unwrap();
        assert!(!check.reachable);
        assert!(check.error.unwrap().contains("connection refused"));

        // Recovery restores readiness without a phase change
        assert!(lc.check_store(&MemoryStore::new()).await);
        assert_eq!(lc.not_ready_reason(), None);

        lc.begin_shutdown();
        assert_eq!(lc.not_ready_reason(), Some(NotReady::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_monitor_stops_on_shutdown() {
        let lc = lifecycle();
        let handle = lc.spawn_store_monitor(Arc::new(MemoryStore::new()), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(lc.last_store_check().unwrap().reachable);

        lc.begin_shutdown();
        handle.await.unwrap();
    }
}
