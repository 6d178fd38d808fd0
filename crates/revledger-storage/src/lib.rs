//! HTTP fetch utilities and the canonical store for the revenue ledger.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub mod memory;
pub mod postgres;
pub mod store;
pub mod upsert;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{CanonicalStore, EntityRepository, SheetRowRepository, StoreError};
pub use upsert::{upsert_batch, UpsertOutcome};

pub const CRATE_NAME: &str = "revledger-storage";

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }

    /// Timeout-class failures: the request never produced a response.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status()
            .and_then(|s| StatusCode::from_u16(s).ok())
            .is_some_and(|s| classify_status(s) == RetryDisposition::Retryable)
    }
}

/// Retry predicate for sources that only retry timeouts and connection failures.
pub fn retry_transient(err: &FetchError) -> bool {
    err.is_transient()
}

/// Retry predicate for rate-limited sources: transient failures plus HTTP 429.
pub fn retry_transient_or_rate_limited(err: &FetchError) -> bool {
    err.is_transient() || err.is_rate_limited()
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
            base_delay: Duration::from_millis(500),
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
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are spent. `op` receives the 0-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Request-rate ceilings keyed by the `source_id` passed to `send_json`.
    pub rate_limits: HashMap<String, RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 8,
            backoff: BackoffPolicy::default(),
            rate_limits: HashMap::new(),
        }
    }
}

/// `burst` requests may go out back to back, after which one is admitted every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: Duration::from_secs(1) / requests,
        })
    }
}

/// Admission by theoretical arrival time: each request pushes the schedule one
/// `interval` forward and waits only once the schedule runs `burst` ahead of now.
#[derive(Debug)]
struct RateLimiter {
    limit: RateLimit,
    next_arrival: Mutex<Instant>,
}

impl RateLimiter {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            next_arrival: Mutex::new(Instant::now()),
        }
    }

    async fn admit(&self) {
        let wait = {
            let mut next_arrival = self.next_arrival.lock().await;
            let now = Instant::now();
            let scheduled = (*next_arrival).max(now);
            let slack = self.limit.interval * self.limit.burst.saturating_sub(1);
            let ready_at = scheduled.checked_sub(slack).map_or(now, |t| t.max(now));
            *next_arrival = scheduled + self.limit.interval;
            ready_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Shared JSON client: fixed timeout, bounded concurrency, per-source rate limits,
/// and the one retry loop every adapter goes through.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiters: HashMap<String, RateLimiter>,
    backoff: BackoffPolicy,
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

        let client = builder.build().context("building reqwest client")?;
        let rate_limiters = config
            .rate_limits
            .into_iter()
            .map(|(source_id, limit)| (source_id, RateLimiter::new(limit)))
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limiters,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Sends the request produced by `build` and decodes a JSON body.
    ///
    /// `build` runs once per attempt so each retry sends a fresh request. Concurrency
    /// permits are held for a single attempt, never across a backoff sleep.
    pub async fn send_json<T, B, P>(
        &self,
        source_id: &str,
        is_retryable: P,
        build: B,
    ) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
        P: Fn(&FetchError) -> bool,
    {
        let per_source = self.per_source_semaphore(source_id).await;
        let rate_limiter = self.rate_limiters.get(source_id);

        let span = info_span!("http_fetch", source_id);
        retry_with_backoff(&self.backoff, is_retryable, |attempt| {
            let request = build(&self.client);
            let per_source = per_source.clone();
            async move {
                let _global = self
                    .global_limit
                    .acquire()
                    .await
                    .expect("semaphore not closed");
                let _source = per_source.acquire().await.expect("semaphore not closed");
                if let Some(limiter) = rate_limiter {
                    limiter.admit().await;
                }
                debug!(attempt, "sending request");
                let resp = request.send().await?;
                let status = resp.status();
                let url = resp.url().to_string();
                let body = resp.bytes().await?;

                if !status.is_success() {
                    let text = String::from_utf8_lossy(&body);
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body: text.chars().take(ERROR_BODY_LIMIT).collect(),
                    });
                }

                serde_json::from_slice(&body).map_err(|source| FetchError::Decode { url, source })
            }
        })
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retry_stops_after_bounded_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry_with_backoff(&fast_policy(2), |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("timeout".to_string()) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry_with_backoff(&fast_policy(5), |_| false, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("401".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let result: Result<usize, String> = retry_with_backoff(&fast_policy(3), |_| true, |attempt| async move {
            if attempt < 2 {
                Err(format!("attempt {attempt} timed out"))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn http_status_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/thing")
            .with_status(401)
            .with_body("bad token")
            .expect(1)
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: fast_policy(3),
            ..Default::default()
        })
        .unwrap();
        let url = format!("{}/thing", server.url());
        let err = fetcher
            .send_json::<serde_json::Value, _, _>("test", retry_transient, |c| c.get(&url))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(!retry_transient(&err));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limited_responses_are_retried_when_allowed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/limited")
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: fast_policy(2),
            ..Default::default()
        })
        .unwrap();
        let url = format!("{}/limited", server.url());
        let err = fetcher
            .send_json::<serde_json::Value, _, _>("crm", retry_transient_or_rate_limited, |c| {
                c.get(&url)
            })
            .await
            .unwrap_err();

        assert!(err.is_rate_limited());
        mock.assert_async().await;
    }

    #[test]
    fn per_second_limit_spreads_requests_over_a_second() {
        assert_eq!(RateLimit::per_second(0), None);
        assert_eq!(
            RateLimit::per_second(4),
            Some(RateLimit {
                burst: 4,
                interval: Duration::from_millis(250),
            })
        );
    }

    #[tokio::test]
    async fn rate_limiter_admits_a_burst_then_one_per_interval() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            interval: Duration::from_millis(60),
        });
        let started = Instant::now();
        limiter.admit().await;
        limiter.admit().await;
        assert!(started.elapsed() < Duration::from_millis(30));

        limiter.admit().await;
        limiter.admit().await;
        assert!(started.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn rate_limit_applies_only_to_its_source() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ok")
            .with_body("{}")
            .expect(6)
            .create_async()
            .await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            rate_limits: HashMap::from([(
                "crm".to_string(),
                RateLimit {
                    burst: 1,
                    interval: Duration::from_millis(60),
                },
            )]),
            ..Default::default()
        })
        .unwrap();
        let url = format!("{}/ok", server.url());

        let started = Instant::now();
        for _ in 0..3 {
            fetcher
                .send_json::<serde_json::Value, _, _>("payments", retry_transient, |c| c.get(&url))
                .await
                .unwrap();
        }
        let unthrottled = started.elapsed();

        let started = Instant::now();
        for _ in 0..3 {
            fetcher
                .send_json::<serde_json::Value, _, _>("crm", retry_transient, |c| c.get(&url))
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(110));
        assert!(unthrottled < Duration::from_millis(100));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn backoff_sleep_does_not_hold_the_source_permit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/limited")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;
        server.mock("GET", "/ok").with_body("{}").create_async().await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            per_source_concurrency: 1,
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(150),
                max_delay: Duration::from_millis(150),
            },
            ..Default::default()
        })
        .unwrap();
        let limited_url = format!("{}/limited", server.url());
        let ok_url = format!("{}/ok", server.url());

        let started = Instant::now();
        let (limited, ok) = tokio::join!(
            async {
                let result = fetcher
                    .send_json::<serde_json::Value, _, _>("crm", retry_transient_or_rate_limited, |c| {
                        c.get(&limited_url)
                    })
                    .await;
                (result, started.elapsed())
            },
            async {
                let result = fetcher
                    .send_json::<serde_json::Value, _, _>("crm", retry_transient, |c| c.get(&ok_url))
                    .await;
                (result, started.elapsed())
            },
        );

        assert!(limited.0.unwrap_err().is_rate_limited());
        assert!(ok.0.is_ok());
        assert!(ok.1 < limited.1);
    }
}
