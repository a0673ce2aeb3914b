//! HTTP GET for source pages: one client, a hard per-request timeout and an
//! optional backoff on transient failures.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// 429 and 5xx are worth another attempt; anything else is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Exponential backoff between attempts. Collection runs default to zero
/// retries: a failed home is counted and picked up by the next run.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based), capped at `max_delay`.
    pub fn delay_before(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A successful (2xx) response body.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { status: StatusCode, url: String },
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Request { source, .. } => is_transient_error(source),
            Self::Status { status, .. } => is_transient_status(*status),
        }
    }
}

/// Shared GET client for the source adapters.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let mut retry = 0;
            loop {
                match self.get_once(url).await {
                    Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay_before(retry);
                        warn!(error = %err, retry, ?delay, "transient fetch failure; retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    result => return result,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await.map_err(request_error)?.to_vec();
        debug!(bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            final_url,
            content_type,
            body,
        })
    }
}
