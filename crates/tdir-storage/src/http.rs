//! HTTP GET with retry/backoff, a global concurrency cap and optional rate limiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 16,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// One fetch lane (live pages or the archive), with its own client, limits
/// and retry policy.
#[derive(Debug)]
pub struct HttpFetcher {
    lane: &'static str,
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(lane: &'static str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            lane,
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET `url` as text, retrying per the lane's backoff policy. Only HTTP
    /// 200 counts as success.
    pub async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        self.get_with_policy(url, timeout, self.backoff).await
    }

    /// Single attempt, no retries.
    pub async fn get_text_once(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        self.get_with_policy(url, timeout, BackoffPolicy::no_retries())
            .await
    }

    async fn get_with_policy(
        &self,
        url: &str,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", lane = self.lane, url);
        async {
            let _permit = self.limit.acquire().await.expect("semaphore not closed");

            let mut last_error: Option<FetchError> = None;

            for attempt in 0..=backoff.max_retries {
                if attempt > 0 {
                    tokio::time::sleep(backoff.delay_for_attempt(attempt - 1)).await;
                }
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                let err = match self.client.get(url).timeout(timeout).send().await {
                    Ok(resp) if resp.status() == StatusCode::OK => {
                        return resp.text().await.map_err(FetchError::Request);
                    }
                    // any other status, 2xx included, is a failed attempt
                    Ok(resp) => FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                            return Err(FetchError::Request(err));
                        }
                        FetchError::Request(err)
                    }
                };
                debug!(attempt, error = %err, "fetch attempt failed");
                last_error = Some(err);
            }

            Err(last_error.expect("retry loop should record its last error"))
        }
        .instrument(span)
        .await
    }
}
