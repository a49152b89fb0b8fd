//! Shared HTTP client for every source: bounded concurrency, retry with capped
//! exponential delay, and `Retry-After` on throttled responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max_delay`.
    /// A server-supplied `Retry-After` wins but is still capped.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let doubled = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map(|factor| self.base_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay);
        retry_after.unwrap_or(doubled).min(self.max_delay)
    }
}

pub fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_limit: config.max_in_flight_per_source.max(1),
            per_source: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn source_slot(&self, source_id: &str) -> Arc<Semaphore> {
        self.per_source
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_inner(source_id, url).instrument(span).await
    }

    async fn fetch_inner(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let slot = self.source_slot(source_id).await;
        let _source = slot.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let (wait, failure) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(%status, bytes = body.len(), "fetched");
                    return Ok(FetchedResponse { status, final_url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !retryable_status(status) {
                        return Err(failure);
                    }
                    (retry_after(resp.headers()), failure)
                }
                Err(err) if retryable_error(&err) => (None, FetchError::Request(err)),
                Err(err) => return Err(FetchError::Request(err)),
            };

            if attempt >= self.retry.max_retries {
                warn!(attempts = attempt + 1, error = %failure, "giving up");
                return Err(failure);
            }
            let delay = self.retry.delay(attempt, wait);
            debug!(attempt, ?delay, error = %failure, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
