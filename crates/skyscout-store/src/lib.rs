//! Outbound HTTP plumbing + in-memory aggregate stores for SkyScout.
//!
//! Offers themselves are never persisted; the stores keep only aggregate
//! facts (route search counts, best price seen) and the current promotional
//! deal set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use skyscout_core::SearchParams;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "skyscout-store";

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            per_provider_concurrency: 2,
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

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Upstream status code, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Shared outbound HTTP client with retry, rate limiting, and
/// per-provider concurrency caps. One instance serves all providers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_provider_semaphore(&self, provider_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// GET `url` with provider-specific headers, retrying transient failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        provider_id: &str,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_provider = self.per_provider_semaphore(provider_id).await;
        let _provider = per_provider.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, provider_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Search history (aggregate facts only)
// ---------------------------------------------------------------------------

/// Aggregate record for one origin/destination/date route.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RouteStats {
    pub origin: String,
    pub destination: String,
    pub departure_date: chrono::NaiveDate,
    pub search_count: u64,
    /// Minor currency units; minimum over all searches of this route.
    pub best_price_seen: Option<i64>,
    pub currency: String,
    pub last_searched_at: DateTime<Utc>,
}

/// In-memory search history. Keyed by `ORIGIN:DEST:DATE`; offers are not
/// stored, only the aggregates the dashboard needs.
#[derive(Debug, Default)]
pub struct HistoryStore {
    inner: RwLock<HashMap<String, RouteStats>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_key(params: &SearchParams) -> String {
        format!(
            "{}:{}:{}",
            params.origin.to_ascii_uppercase(),
            params.destination.to_ascii_uppercase(),
            params.departure_date
        )
    }

    pub async fn record_search(
        &self,
        params: &SearchParams,
        best_price: Option<i64>,
        currency: &str,
    ) {
        let key = Self::route_key(params);
        let now = Utc::now();
        let mut map = self.inner.write().await;
        let entry = map.entry(key).or_insert_with(|| RouteStats {
            origin: params.origin.to_ascii_uppercase(),
            destination: params.destination.to_ascii_uppercase(),
            departure_date: params.departure_date,
            search_count: 0,
            best_price_seen: None,
            currency: currency.to_string(),
            last_searched_at: now,
        });
        entry.search_count += 1;
        entry.last_searched_at = now;
        if let Some(price) = best_price {
            entry.best_price_seen = Some(match entry.best_price_seen {
                Some(existing) => existing.min(price),
                None => price,
            });
            entry.currency = currency.to_string();
        }
    }

    pub async fn stats_for(&self, params: &SearchParams) -> Option<RouteStats> {
        self.inner.read().await.get(&Self::route_key(params)).cloned()
    }

    /// Newest-first, truncated to `limit`.
    pub async fn recent(&self, limit: usize) -> Vec<RouteStats> {
        let map = self.inner.read().await;
        let mut rows: Vec<RouteStats> = map.values().cloned().collect();
        rows.sort_by(|a, b| b.last_searched_at.cmp(&a.last_searched_at));
        rows.truncate(limit);
        rows
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Promotional deals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub destination: String,
    pub airline: String,
    /// Minor currency units, after discount.
    pub price: i64,
    pub currency: String,
    pub discount_percent: u8,
    pub valid_until: DateTime<Utc>,
}

/// In-memory promotional deal set; replaced wholesale on each refresh.
#[derive(Debug, Default)]
pub struct DealStore {
    inner: RwLock<Vec<Deal>>,
}

impl DealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace_all(&self, deals: Vec<Deal>) {
        *self.inner.write().await = deals;
    }

    pub async fn all(&self) -> Vec<Deal> {
        self.inner.read().await.clone()
    }

    pub async fn active(&self, now: DateTime<Utc>) -> Vec<Deal> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|d| d.valid_until > now)
            .cloned()
            .collect()
    }
}
