//! HTTP client for the upstream task API.
//!
//! # Connection pooling
//!
//! One `reqwest::Client` is shared by every caller. The caller's credential
//! is bound right before each logical use with
//! [`UpstreamClient::authorized`], so no per-user client state exists.
//!
//! # Retries
//!
//! Each logical call runs in a bounded retry loop. Network-level failures
//! and 5xx responses are retried after `retry_delay × attempt`; any 4xx is
//! final. Terminal failures always leave this module already mapped to the
//! gateway taxonomy via [`map_vikunja_error`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::config::UpstreamConfig;
use crate::context::RequestContext;
use crate::error::{GatewayError, map_vikunja_error, upstream_message};
use crate::telemetry::GatewayMetrics;

/// Header carrying the gateway request id to the upstream.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Outcome of one failed attempt.
#[derive(Debug)]
struct AttemptFailure {
    /// `None` when no response was received.
    status: Option<u16>,
    message: String,
    retryable: bool,
}

impl AttemptFailure {
    fn fatal(error: GatewayError) -> Self {
        Self {
            status: None,
            message: error.message().to_string(),
            retryable: false,
        }
    }
}

/// Shared, pooled client for the task API.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    config: UpstreamConfig,
    /// Pre-computed `{base_url}{api_prefix}`.
    api_base: String,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl UpstreamClient {
    /// Create a new upstream client.
    ///
    /// # Errors
    ///
    /// `Internal` if the base URL is empty or invalid, or the HTTP client
    /// cannot be built.
    pub fn new(config: UpstreamConfig) -> Result<Self, GatewayError> {
        if config.base_url.trim().is_empty() {
            return Err(GatewayError::internal("upstream base_url is empty"));
        }
        if let Err(e) = reqwest::Url::parse(&config.base_url) {
            return Err(GatewayError::internal(format!(
                "invalid upstream base_url '{}': {e}",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;

        let api_base = config.api_base();

        Ok(Self {
            client,
            config,
            api_base,
            metrics: None,
        })
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Bind a caller credential for one or more calls.
    pub fn authorized<'a>(&'a self, token: &'a str) -> AuthorizedUpstream<'a> {
        AuthorizedUpstream {
            client: self,
            token,
        }
    }

    /// Check that the upstream answers HTTP at all.
    ///
    /// Any response, including 4xx, counts as reachable.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        match self
            .client
            .get(format!("{}/info", self.api_base))
            .timeout(self.config.connect_timeout())
            .send()
            .await
        {
            Ok(resp) => {
                debug!(status = %resp.status(), "Upstream health check: reachable");
                Ok(())
            }
            Err(e) => Err(map_vikunja_error(None, e.to_string())),
        }
    }

    /// Run one logical call with retries.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.api_base, path);
        let request_id = RequestContext::current_request_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self
                .send_once(&method, &url, path, token, body.as_deref(), &request_id, attempt)
                .await
            {
                Ok(bytes) => return parse_body(&bytes, path),
                Err(failure) => {
                    if !failure.retryable || attempt >= max_attempts {
                        if failure.retryable {
                            warn!(
                                method = %method,
                                path,
                                attempts = attempt,
                                status = failure.status,
                                request_id = %request_id,
                                "Upstream retries exhausted"
                            );
                        }
                        return Err(map_vikunja_error(failure.status, failure.message));
                    }

                    let delay = self.config.retry_delay().saturating_mul(attempt);
                    warn!(
                        method = %method,
                        path,
                        attempt,
                        max_attempts,
                        status = failure.status,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        request_id = %request_id,
                        "Upstream call failed, retrying"
                    );
                    if let Some(m) = &self.metrics {
                        m.record_upstream_retry();
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        path: &str,
        token: &str,
        body: Option<&[u8]>,
        request_id: &str,
        attempt: u32,
    ) -> Result<bytes::Bytes, AttemptFailure> {
        debug!(method = %method, path, attempt, request_id, "Upstream request");
        let started = std::time::Instant::now();

        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(REQUEST_ID_HEADER, request_id);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let result = request.send().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_upstream(method.as_str(), None, elapsed_ms);
                }
                warn!(
                    method = %method,
                    path,
                    attempt,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    error = %e,
                    "Upstream request failed without response"
                );
                return Err(AttemptFailure {
                    status: None,
                    message: format!("Upstream unreachable: {e}"),
                    retryable: true,
                });
            }
        };

        let status = response.status();
        if let Some(m) = &self.metrics {
            m.record_upstream(method.as_str(), Some(status.as_u16()), elapsed_ms);
        }
        debug!(
            method = %method,
            path,
            attempt,
            status = status.as_u16(),
            latency_ms = elapsed_ms,
            request_id,
            "Upstream response"
        );

        let bytes = self
            .read_body_limited(response)
            .await
            .map_err(AttemptFailure::fatal)?;

        if status.is_success() {
            return Ok(bytes);
        }

        let message = upstream_message(status.as_u16(), &String::from_utf8_lossy(&bytes));
        Err(AttemptFailure {
            status: Some(status.as_u16()),
            message,
            retryable: is_retryable_status(status),
        })
    }

    /// Read the response body with a size limit.
    ///
    /// Checks `Content-Length` first for early rejection, then streams chunks
    /// so bodies without a length cannot grow unbounded.
    async fn read_body_limited(
        &self,
        mut response: reqwest::Response,
    ) -> Result<bytes::Bytes, GatewayError> {
        let max_size = self.config.max_response_body_bytes;

        if let Some(content_length) = response.content_length()
            && content_length as usize > max_size
        {
            warn!(
                content_length,
                max_size, "Upstream response exceeds size limit (Content-Length)"
            );
            return Err(GatewayError::internal(format!(
                "Upstream response too large: {content_length} bytes exceeds {max_size} byte limit"
            )));
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|cl| cl as usize)
                .unwrap_or(8192)
                .min(max_size),
        );
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            error!(error = %e, "Failed to read upstream response body");
            GatewayError::internal(format!("Failed to read upstream response: {e}"))
        })? {
            if buf.len() + chunk.len() > max_size {
                warn!(
                    accumulated = buf.len(),
                    max_size, "Upstream response exceeds size limit during streaming"
                );
                return Err(GatewayError::internal(format!(
                    "Upstream response too large: exceeds {max_size} byte limit"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.into())
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("api_base", &self.api_base)
            .field("max_attempts", &self.config.max_attempts)
            .finish_non_exhaustive()
    }
}

/// 5xx is transient; 4xx means the request itself is wrong.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

fn parse_body<T: DeserializeOwned>(bytes: &[u8], path: &str) -> Result<T, GatewayError> {
    let bytes: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|e| {
        error!(path, error = %e, body_size = bytes.len(), "Failed to parse upstream response");
        GatewayError::internal(format!("Malformed upstream response: {e}"))
    })
}

/// An [`UpstreamClient`] with a caller credential bound.
#[derive(Clone, Copy)]
pub struct AuthorizedUpstream<'a> {
    client: &'a UpstreamClient,
    token: &'a str,
}

impl AuthorizedUpstream<'_> {
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.client
            .execute(Method::GET, path, self.token, None)
            .await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.client
            .execute(Method::POST, path, self.token, Some(body))
            .await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.client
            .execute(Method::PUT, path, self.token, Some(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.client
            .execute(Method::DELETE, path, self.token, None)
            .await
    }
}

impl std::fmt::Debug for AuthorizedUpstream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedUpstream")
            .field("client", self.client)
            .finish_non_exhaustive()
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>, GatewayError> {
    serde_json::to_vec(body)
        .map_err(|e| GatewayError::internal(format!("Failed to encode request body: {e}")))
}
