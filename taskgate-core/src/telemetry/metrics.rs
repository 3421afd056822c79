//! Prometheus metrics using the prometheus-client crate.
//!
//! [`GatewayMetrics`] registers every gateway metric on a shared registry.
//! The admin server encodes that registry at `/metrics` in OpenMetrics text
//! format. Counters are registered without the `_total` suffix; the encoder
//! appends it.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for inbound request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// JSON-RPC method name (e.g., "tools/call")
    pub method: String,
    /// "success" or the error kind name
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MethodLabels {
    pub method: String,
}

/// Labels for admission rejections.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    /// "authentication" or "rate_limit"
    pub kind: String,
}

/// Labels for upstream call counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    /// HTTP method
    pub method: String,
    /// HTTP status code, or "error" when no response arrived
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "success" or "failure"
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Buckets
// ─────────────────────────────────────────────────────────────────────────────

/// Request latency buckets in milliseconds.
static REQUEST_DURATION_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Upstream latency buckets in milliseconds.
static UPSTREAM_BUCKETS: [f64; 10] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Every metric the gateway exports.
pub struct GatewayMetrics {
    /// Inbound JSON-RPC requests by method and outcome.
    pub requests_total: Family<RequestLabels, Counter>,

    /// End-to-end request latency in milliseconds.
    pub request_duration_ms: Family<MethodLabels, Histogram>,

    /// Requests rejected before reaching a handler.
    pub admission_rejections_total: Family<RejectionLabels, Counter>,

    pub auth_cache_hits_total: Counter,
    pub auth_cache_misses_total: Counter,

    /// Upstream calls by method and final status.
    pub upstream_requests_total: Family<UpstreamLabels, Counter>,

    /// Upstream call latency in milliseconds, per attempt.
    pub upstream_duration_ms: Family<MethodLabels, Histogram>,

    /// Upstream attempts beyond the first.
    pub upstream_retries_total: Counter,

    /// Open client sessions.
    pub active_sessions: Gauge,

    /// Store connect attempts by outcome.
    pub store_connect_attempts_total: Family<OutcomeLabels, Counter>,
}

impl GatewayMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        // ─────────────────────────────────────────────────────────────────────
        // Counters
        // ─────────────────────────────────────────────────────────────────────

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "taskgate_requests",
            "Inbound JSON-RPC requests",
            requests_total.clone(),
        );

        let admission_rejections_total = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "taskgate_admission_rejections",
            "Requests rejected by authentication or rate limiting",
            admission_rejections_total.clone(),
        );

        let auth_cache_hits_total = Counter::default();
        registry.register(
            "taskgate_auth_cache_hits",
            "Credential validations served from cache",
            auth_cache_hits_total.clone(),
        );

        let auth_cache_misses_total = Counter::default();
        registry.register(
            "taskgate_auth_cache_misses",
            "Credential validations that called the identity endpoint",
            auth_cache_misses_total.clone(),
        );

        let upstream_requests_total = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "taskgate_upstream_requests",
            "Upstream task API calls",
            upstream_requests_total.clone(),
        );

        let upstream_retries_total = Counter::default();
        registry.register(
            "taskgate_upstream_retries",
            "Upstream attempts beyond the first",
            upstream_retries_total.clone(),
        );

        let store_connect_attempts_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "taskgate_store_connect_attempts",
            "Rate-limit store connect attempts",
            store_connect_attempts_total.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Histograms
        // ─────────────────────────────────────────────────────────────────────

        let request_duration_ms = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "taskgate_request_duration_ms",
            "End-to-end request latency in milliseconds",
            request_duration_ms.clone(),
        );

        let upstream_duration_ms = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(UPSTREAM_BUCKETS.iter().copied())
        });
        registry.register(
            "taskgate_upstream_duration_ms",
            "Upstream call latency in milliseconds",
            upstream_duration_ms.clone(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // Gauges
        // ─────────────────────────────────────────────────────────────────────

        let active_sessions = Gauge::default();
        registry.register(
            "taskgate_active_sessions",
            "Open client sessions",
            active_sessions.clone(),
        );

        Self {
            requests_total,
            request_duration_ms,
            admission_rejections_total,
            auth_cache_hits_total,
            auth_cache_misses_total,
            upstream_requests_total,
            upstream_duration_ms,
            upstream_retries_total,
            active_sessions,
            store_connect_attempts_total,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_request(&self, method: &str, outcome: &str, duration_ms: f64) {
        self.requests_total
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.request_duration_ms
            .get_or_create(&MethodLabels {
                method: method.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_rejection(&self, kind: &str) {
        self.admission_rejections_total
            .get_or_create(&RejectionLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_cache_hit(&self) {
        self.auth_cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.auth_cache_misses_total.inc();
    }

    /// Record one upstream attempt. `status` is `None` for network failures.
    pub fn record_upstream(&self, method: &str, status: Option<u16>, duration_ms: f64) {
        let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
        self.upstream_requests_total
            .get_or_create(&UpstreamLabels {
                method: method.to_string(),
                status,
            })
            .inc();
        self.upstream_duration_ms
            .get_or_create(&MethodLabels {
                method: method.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_upstream_retry(&self) {
        self.upstream_retries_total.inc();
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_store_connect(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.store_connect_attempts_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(registry: &Registry) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .expect("encoding should succeed");
        buffer
    }

    #[test]
    fn test_metrics_registration() {
        let mut registry = Registry::default();
        let metrics = GatewayMetrics::new(&mut registry);

        metrics.record_request("tools/call", "success", 12.0);
        metrics.record_rejection("rate_limit");
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_upstream("GET", Some(200), 40.0);
        metrics.record_upstream("GET", None, 3.0);
        metrics.record_upstream_retry();
        metrics.set_active_sessions(3);
        metrics.record_store_connect(false);

        let buffer = encode(&registry);
        assert!(buffer.contains("taskgate_requests_total"));
        assert!(buffer.contains("taskgate_admission_rejections_total{kind=\"rate_limit\"} 1"));
        assert!(buffer.contains("taskgate_auth_cache_hits_total 1"));
        assert!(buffer.contains("taskgate_upstream_requests_total{method=\"GET\",status=\"error\"} 1"));
        assert!(buffer.contains("taskgate_active_sessions 3"));
        assert!(buffer.contains("taskgate_store_connect_attempts_total{outcome=\"failure\"} 1"));
    }

    #[test]
    fn test_histogram_buckets() {
        let mut registry = Registry::default();
        let metrics = GatewayMetrics::new(&mut registry);

        metrics.record_request("ping", "success", 0.5);
        metrics.record_request("ping", "success", 2000.0);

        let buffer = encode(&registry);
        assert!(buffer.contains("taskgate_request_duration_ms_bucket"));
    }
}
