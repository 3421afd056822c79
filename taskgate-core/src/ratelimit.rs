//! Per-identity sliding-window rate limiting.
//!
//! Each identity owns a sorted set `ratelimit:{identity}` in the
//! [`RateLimitStore`]. Every admitted call adds one member scored at the
//! current epoch millisecond; members older than the window are trimmed on
//! each check, and the set cardinality is the number of calls in the window.
//!
//! # Soft limit
//!
//! Trim, count and insert are separate store commands. Two checks for the
//! same identity that interleave between count and insert can both be
//! admitted, so a window may hold up to `burst + concurrent_checks - 1`
//! entries. This is accepted: the limiter protects the upstream from
//! sustained overload, not from a handful of extra requests.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::clock::{Clock, ms_to_datetime};
use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::store::RateLimitStore;
use crate::telemetry::fingerprint;

/// Key prefix for per-identity windows.
pub const KEY_PREFIX: &str = "ratelimit:";

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    burst: u32,
    enabled: bool,
    admin_bypass: bool,
    admins: DashSet<String>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        config: &RateLimitConfig,
    ) -> Self {
        let limiter = Self {
            store,
            clock,
            window: config.window(),
            burst: config.burst,
            enabled: config.enabled,
            admin_bypass: config.admin_bypass,
            admins: DashSet::new(),
        };
        for token in &config.admin_tokens {
            limiter.mark_as_admin(token.expose());
        }
        info!(
            enabled = limiter.enabled,
            burst = limiter.burst,
            window_secs = limiter.window.as_secs(),
            admin_bypass = limiter.admin_bypass,
            admins = limiter.admins.len(),
            store = limiter.store.name(),
            "Rate limiter configured"
        );
        limiter
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    fn key(identity: &str) -> String {
        format!("{KEY_PREFIX}{identity}")
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    fn bypasses(&self, identity: &str) -> bool {
        !self.enabled || (self.admin_bypass && self.admins.contains(identity))
    }

    /// Admit one call for `identity`, or reject it.
    ///
    /// # Errors
    ///
    /// - `RateLimit` with `remaining = 0` and the window reset time when the
    ///   identity already made `burst` calls in the trailing window
    /// - `Internal` when the store is unavailable
    pub async fn check_limit(&self, identity: &str) -> Result<(), GatewayError> {
        if self.bypasses(identity) {
            return Ok(());
        }

        let key = Self::key(identity);
        let now = self.clock.now_ms();
        let window_start = now - self.window_ms();

        // Scores equal to window_start are still inside the window
        self.store
            .zremrangebyscore(&key, i64::MIN, window_start - 1)
            .await?;
        let count = self.store.zcard(&key).await?;

        if count >= u64::from(self.burst) {
            let reset_at = ms_to_datetime(now + self.window_ms());
            debug!(
                identity = %fingerprint(identity),
                count,
                burst = self.burst,
                "Rate limit exceeded"
            );
            return Err(GatewayError::rate_limit(0, reset_at));
        }

        let member = format!("{now}-{:08x}", rand::random::<u32>());
        self.store.zadd(&key, now, &member).await?;
        if !self.store.expire(&key, self.window).await? {
            warn!(identity = %fingerprint(identity), "Window key vanished before expiry was set");
        }
        Ok(())
    }

    /// Calls left for `identity` in the current window.
    ///
    /// Returns `u32::MAX` for identities that bypass the limiter. Does not
    /// consume a slot.
    pub async fn remaining_requests(&self, identity: &str) -> Result<u32, GatewayError> {
        if self.bypasses(identity) {
            return Ok(u32::MAX);
        }
        let key = Self::key(identity);
        let window_start = self.clock.now_ms() - self.window_ms();
        self.store
            .zremrangebyscore(&key, i64::MIN, window_start - 1)
            .await?;
        let count = self.store.zcard(&key).await?;
        let used = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(self.burst.saturating_sub(used))
    }

    /// Put `identity` on the admin allowlist.
    pub fn mark_as_admin(&self, identity: &str) {
        if self.admins.insert(identity.to_string()) {
            info!(identity = %fingerprint(identity), "Identity added to admin allowlist");
        }
    }

    pub fn unmark_admin(&self, identity: &str) {
        if self.admins.remove(identity).is_some() {
            info!(identity = %fingerprint(identity), "Identity removed from admin allowlist");
        }
    }

    /// Whether `identity` is on the allowlist (regardless of the bypass flag).
    pub fn is_admin_token(&self, identity: &str) -> bool {
        self.admins.contains(identity)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .field("burst", &self.burst)
            .field("enabled", &self.enabled)
            .field("admin_bypass", &self.admin_bypass)
            .field("admins", &self.admins.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Secret;
    use crate::error::{ErrorKind, GatewayError};
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    const T0: i64 = 1_767_225_600_000;

    fn config(burst: u32, admin_bypass: bool) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window_secs: 60,
            burst,
            admin_bypass,
            admin_tokens: Vec::new(),
        }
    }

    fn limiter(burst: u32, admin_bypass: bool) -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            Arc::clone(&store) as Arc<dyn RateLimitStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            &config(burst, admin_bypass),
        );
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_burst_boundary() {
        let (_, _, limiter) = limiter(3, false);
        for _ in 0..3 {
            limiter.check_limit("tok-1").await.unwrap();
        }
        let err = limiter.check_limit("tok-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        match err {
            GatewayError::RateLimit {
                remaining, reset_at, ..
            } => {
                assert_eq!(remaining, 0);
                assert_eq!(reset_at, ms_to_datetime(T0 + 60_000));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(limiter.remaining_requests("tok-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (_, _, limiter) = limiter(1, false);
        limiter.check_limit("tok-1").await.unwrap();
        assert!(limiter.check_limit("tok-1").await.is_err());
        limiter.check_limit("tok-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_window_rollover_prunes_old_entries() {
        let (clock, store, limiter) = limiter(3, false);
        for _ in 0..3 {
            limiter.check_limit("tok-1").await.unwrap();
        }
        assert!(limiter.check_limit("tok-1").await.is_err());

        clock.advance_ms(60_001);
        assert_eq!(limiter.remaining_requests("tok-1").await.unwrap(), 3);
        assert_eq!(store.zcard("ratelimit:tok-1").await.unwrap(), 0);
        limiter.check_limit("tok-1").await.unwrap();
        assert_eq!(limiter.remaining_requests("tok-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sliding_window_frees_slots_gradually() {
        let (clock, _, limiter) = limiter(2, false);
        limiter.check_limit("tok-1").await.unwrap();
        clock.advance_ms(30_000);
        limiter.check_limit("tok-1").await.unwrap();
        assert!(limiter.check_limit("tok-1").await.is_err());

        // Only the first entry has left the window
        clock.advance_ms(30_001);
        limiter.check_limit("tok-1").await.unwrap();
        assert!(limiter.check_limit("tok-1").await.is_err());
    }

    #[tokio::test]
    async fn test_admin_bypass_consumes_no_slots() {
        let (_, store, limiter) = limiter(2, true);
        limiter.mark_as_admin("tok-admin");
        assert!(limiter.is_admin_token("tok-admin"));

        for _ in 0..50 {
            limiter.check_limit("tok-admin").await.unwrap();
        }
        assert_eq!(store.zcard("ratelimit:tok-admin").await.unwrap(), 0);
        assert_eq!(
            limiter.remaining_requests("tok-admin").await.unwrap(),
            u32::MAX
        );

        limiter.unmark_admin("tok-admin");
        assert!(!limiter.is_admin_token("tok-admin"));
        limiter.check_limit("tok-admin").await.unwrap();
        limiter.check_limit("tok-admin").await.unwrap();
        assert!(limiter.check_limit("tok-admin").await.is_err());
    }

    #[tokio::test]
    async fn test_allowlist_ignored_without_bypass_flag() {
        let (_, _, limiter) = limiter(1, false);
        limiter.mark_as_admin("tok-admin");
        limiter.check_limit("tok-admin").await.unwrap();
        assert!(limiter.check_limit("tok-admin").await.is_err());
    }

    #[tokio::test]
    async fn test_configured_admin_tokens_are_allowlisted() {
        let mut cfg = config(1, true);
        cfg.admin_tokens = vec![Secret::new("tok-root")];
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
            &cfg,
        );
        assert!(limiter.is_admin_token("tok-root"));
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let mut cfg = config(1, false);
        cfg.enabled = false;
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            Arc::clone(&store) as Arc<dyn RateLimitStore>,
            Arc::new(ManualClock::new(T0)),
            &cfg,
        );
        for _ in 0..10 {
            limiter.check_limit("tok-1").await.unwrap();
        }
        assert!(store.is_empty());
    }

    /// Store that yields before every command, so concurrent checks
    /// interleave between count and insert.
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl RateLimitStore for YieldingStore {
        fn name(&self) -> &'static str {
            "yielding"
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.set(key, value, ttl).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.expire(key, ttl).await
        }
        async fn del(&self, key: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.del(key).await
        }
        async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.zadd(key, score, member).await
        }
        async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.zremrangebyscore(key, min, max).await
        }
        async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.zcard(key).await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Count-then-insert is not atomic: concurrent checks may overshoot the
    /// burst, but never by more than `concurrent - 1`.
    #[tokio::test]
    async fn test_soft_limit_overshoot_is_bounded() {
        let burst = 3u32;
        let concurrent = 6usize;
        let store = Arc::new(YieldingStore(MemoryStore::new()));
        let limiter = RateLimiter::new(
            Arc::clone(&store) as Arc<dyn RateLimitStore>,
            Arc::new(ManualClock::new(T0)),
            &config(burst, false),
        );

        let checks = (0..concurrent).map(|_| limiter.check_limit("tok-1"));
        let results = futures_util::future::join_all(checks).await;
        let admitted = results.iter().filter(|r| r.is_ok()).count();

        assert!(admitted >= burst as usize);
        assert!(admitted <= burst as usize + concurrent - 1);
        assert_eq!(
            store.0.zcard("ratelimit:tok-1").await.unwrap(),
            admitted as u64
        );
    }

    /// Store that is always down.
    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(down())
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn zadd(&self, _: &str, _: i64, _: &str) -> Result<(), StoreError> {
            Err(down())
        }
        async fn zremrangebyscore(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn zcard(&self, _: &str) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(down())
        }
    }

    fn down() -> StoreError {
        StoreError::RetriesExhausted {
            attempts: 5,
            last_error: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_internal() {
        let limiter = RateLimiter::new(
            Arc::new(DownStore),
            Arc::new(ManualClock::new(T0)),
            &config(3, false),
        );
        let err = limiter.check_limit("tok-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
