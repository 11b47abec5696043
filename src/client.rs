//! Cached, retrying, cancellable HTTP fetch client.
//!
//! `fetch_cached` is the single entry point every feed goes through: a valid
//! cache entry short-circuits the network entirely; otherwise the request is
//! attempted up to `max_attempts` times with a fixed 5 s backoff between
//! attempts. Cancellation is honored before dispatch, mid-flight and during
//! the backoff wait, and yields a distinguished `Aborted` outcome rather
//! than an error.

use crate::cache::ResponseCache;
use crate::cancel::CancelToken;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed wait between retry attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "DolarCambio/1.0 (Rates Core)";

/// Outcome of a cached fetch. `Aborted` is a benign result the caller must
/// distinguish from both success and failure; it never carries an error.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Served from the cache without a network call.
    Cached(Value),
    /// Fetched from the network and persisted into the cache.
    Fresh(Value),
    /// The cancellation token fired before a payload was obtained.
    Aborted,
}

impl FetchOutcome {
    pub fn payload(&self) -> Option<&Value> {
        match self {
            FetchOutcome::Cached(v) | FetchOutcome::Fresh(v) => Some(v),
            FetchOutcome::Aborted => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, FetchOutcome::Aborted)
    }
}

/// Terminal fetch failure after exhausting the attempt budget. Downcastable
/// through `anyhow::Error` so callers can inspect the attempt count.
#[derive(Debug)]
pub struct FetchFailure {
    pub attempts: u32,
    pub last_error: String,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for FetchFailure {}

/// Raw transport response: status code plus body text. JSON parsing happens
/// in the client so a structurally invalid body is terminal, not retried.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Seam between the retry policy and the actual HTTP stack. The production
/// implementation wraps `reqwest`; tests substitute counting stubs.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response body from {}", url))?;
        Ok(TransportResponse { status, body })
    }
}

enum RetryResult {
    Body(String),
    Aborted,
}

/// Fetch client shared by all feeds. Cheap to clone; the transport and cache
/// are behind `Arc`.
#[derive(Clone)]
pub struct RateClient {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<ResponseCache>,
}

impl RateClient {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            cache,
        }
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, cache: Arc<ResponseCache>) -> Self {
        Self { transport, cache }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Cached fetch with retries and cooperative cancellation.
    ///
    /// A valid cache entry is returned immediately as `Cached` with no
    /// network call. A fresh fetch parses the body as JSON, persists it
    /// under the URL key and returns `Fresh`. Exhausting `max_attempts`
    /// yields a `FetchFailure` carrying the attempt count and last error.
    pub async fn fetch_cached(
        &self,
        url: &str,
        max_age: Duration,
        max_attempts: u32,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            debug!(url, "fetch aborted before dispatch");
            return Ok(FetchOutcome::Aborted);
        }

        if let Some(hit) = self.cache.get(url, max_age) {
            return Ok(FetchOutcome::Cached(hit));
        }

        let body = match self.fetch_with_retry(url, max_attempts, cancel).await? {
            RetryResult::Aborted => return Ok(FetchOutcome::Aborted),
            RetryResult::Body(body) => body,
        };

        let payload: Value = serde_json::from_str(&body)
            .with_context(|| format!("invalid JSON payload from {}", url))?;
        self.cache.insert(url, payload.clone());
        Ok(FetchOutcome::Fresh(payload))
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        max_attempts: u32,
        cancel: &CancelToken,
    ) -> Result<RetryResult> {
        let mut last_error = anyhow!("no attempts were made");

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                debug!(url, attempt, "fetch aborted before attempt");
                return Ok(RetryResult::Aborted);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(url, attempt, "fetch aborted mid-flight");
                    return Ok(RetryResult::Aborted);
                }
                result = self.transport.get(url) => result,
            };

            match result {
                Ok(response) if response.is_success() => {
                    return Ok(RetryResult::Body(response.body));
                }
                Ok(response) => {
                    last_error = anyhow!(
                        "HTTP error {} from {}: {}",
                        response.status,
                        url,
                        truncate(&response.body)
                    );
                }
                Err(e) => last_error = e,
            }

            warn!(
                url,
                attempt,
                max_attempts,
                error = %last_error,
                "request attempt failed"
            );

            if attempt < max_attempts {
                debug!(url, backoff_ms = RETRY_BACKOFF.as_millis() as u64, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(url, "fetch aborted during backoff wait");
                        return Ok(RetryResult::Aborted);
                    }
                    _ = sleep(RETRY_BACKOFF) => {}
                }
            }
        }

        Err(FetchFailure {
            attempts: max_attempts,
            last_error: last_error.to_string(),
        }
        .into())
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
