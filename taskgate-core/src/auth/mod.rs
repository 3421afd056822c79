//! Bearer credential validation with an in-process TTL cache.
//!
//! Credentials are opaque. The only way to validate one is to round-trip it
//! through the upstream identity endpoint (`GET /user`). Successful results
//! are cached per credential for `ttl`; expired entries are ignored on read
//! and overwritten by the next successful validation. There is no background
//! sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::telemetry::{GatewayMetrics, fingerprint};
use crate::upstream::UpstreamClient;

/// Default lifetime of a cached validation.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// Types
// ============================================================================

/// Identity of an authenticated caller.
///
/// Shared read-only by every later stage of a request. The credential is
/// kept so the handler can call upstream on the caller's behalf; `Debug`
/// never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
    pub username: String,
    pub email: Option<String>,
    pub token: String,
}

impl std::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("token", &"***")
            .finish()
    }
}

/// User record returned by the identity endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    user_context: Arc<UserContext>,
    expires_at: Instant,
}

// ============================================================================
// Identity provider
// ============================================================================

/// Resolves a credential to a user.
///
/// Implemented by [`UpstreamClient`]; tests substitute a fake.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn fetch_user(&self, token: &str) -> Result<UpstreamUser, GatewayError>;
}

#[async_trait]
impl IdentityProvider for UpstreamClient {
    async fn fetch_user(&self, token: &str) -> Result<UpstreamUser, GatewayError> {
        self.authorized(token).get("/user").await
    }
}

// ============================================================================
// Authenticator
// ============================================================================

pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn IdentityProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            ttl,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Validate a credential, returning the caller's identity.
    ///
    /// # Errors
    ///
    /// `Authentication` when the credential is blank or malformed, or when
    /// the identity check fails for any reason. Failures are never cached.
    pub async fn validate(&self, credential: &str) -> Result<Arc<UserContext>, GatewayError> {
        check_format(credential)?;

        if let Some(user) = self.cached(credential) {
            if let Some(m) = &self.metrics {
                m.record_cache_hit();
            }
            debug!(user_id = user.user_id, "Credential served from cache");
            return Ok(user);
        }
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }

        let user = match self.provider.fetch_user(credential).await {
            Ok(user) => user,
            Err(e) => {
                warn!(
                    credential = %fingerprint(credential),
                    error_type = e.kind().as_str(),
                    error = %e,
                    "Identity check failed"
                );
                return Err(GatewayError::authentication("Invalid or expired credential"));
            }
        };

        let context = Arc::new(UserContext {
            user_id: user.id,
            username: user.username,
            email: user.email,
            token: credential.to_string(),
        });
        self.cache.insert(
            credential.to_string(),
            CacheEntry {
                user_context: Arc::clone(&context),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(
            user_id = context.user_id,
            credential = %fingerprint(credential),
            "Credential validated"
        );
        Ok(context)
    }

    /// Drop any cached validation for `credential`. No-op if absent.
    pub fn invalidate(&self, credential: &str) {
        if self.cache.remove(credential).is_some() {
            debug!(credential = %fingerprint(credential), "Credential invalidated");
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of entries in the cache, including expired ones not yet
    /// overwritten.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, credential: &str) -> Option<Arc<UserContext>> {
        let entry = self.cache.get(credential)?;
        (entry.expires_at > Instant::now()).then(|| Arc::clone(&entry.user_context))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("ttl", &self.ttl)
            .field("cached_entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Reject blank credentials and ones that could not survive a header.
fn check_format(credential: &str) -> Result<(), GatewayError> {
    if credential.trim().is_empty() {
        return Err(GatewayError::authentication("Missing credential"));
    }
    if credential
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(GatewayError::authentication("Malformed credential"));
    }
    Ok(())
}

/// Extract the credential from an `Authorization: Bearer` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
