// Serialized, rate-limited access to the upstream XML API
// Every request goes through one worker task so spacing holds across all callers.

use std::{
    io::Read,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::header::{HeaderName, ACCEPT_ENCODING, CONTENT_ENCODING, RETRY_AFTER};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    config::ApiConfig,
    error::{ApiError, FailureKind},
    models::TypeFilter,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
// Upstream hint for queued collection requests when no Retry-After is sent
const QUEUED_RETRY_AFTER: Duration = Duration::from_secs(2);
const MIN_RATE_MULTIPLIER: f64 = 0.05;
// Floor for a misconfigured rate; one request every 100s
const MIN_REQUESTS_PER_SECOND: f64 = 0.01;
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(100);

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_encoding: None,
            retry_after: None,
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, ApiError>;
}

// reqwest-backed transport. Redirects are not followed: upstream answers a
// throttled client with a redirect and we need to see it.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, ApiError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT_ENCODING, "gzip")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::network(format!("request timed out: {e}"))
                } else {
                    ApiError::network(format!("request failed: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_encoding = header(CONTENT_ENCODING);
        let retry_after = header(RETRY_AFTER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::network(format!("failed to read body: {e}")))?;

        Ok(HttpResponse {
            status,
            content_encoding,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub silent_rate_limits: u64,
    pub timeouts: u64,
    pub average_response_time_ms: f64,
    pub queue_depth: usize,
    pub rate_multiplier: f64,
    pub effective_requests_per_second: f64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    silent_rate_limits: AtomicU64,
    timeouts: AtomicU64,
    total_response_ms: AtomicU64,
}

struct Shared {
    transport: Arc<dyn HttpTransport>,
    counters: Counters,
    queued: AtomicUsize,
    // f64 bits
    rate_multiplier: AtomicU64,
    requests_per_second: f64,
    timeout: Duration,
}

impl Shared {
    fn rate_multiplier(&self) -> f64 {
        f64::from_bits(self.rate_multiplier.load(Ordering::Relaxed))
    }

    fn effective_rate(&self) -> f64 {
        self.requests_per_second * self.rate_multiplier()
    }

    async fn dispatch(&self, url: &str) -> Result<String, ApiError> {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.transport.get(url, self.timeout)).await
        {
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ApiError::network(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
            Ok(response) => response.and_then(|r| self.inspect(r)),
        };

        let elapsed = started.elapsed().as_millis() as u64;
        self.counters
            .total_response_ms
            .fetch_add(elapsed, Ordering::Relaxed);
        match &outcome {
            Ok(_) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(url, elapsed_ms = elapsed, "upstream request succeeded");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(url, elapsed_ms = elapsed, kind = %e.kind, error = %e.message, "upstream request failed");
            }
        }
        outcome
    }

    fn silent_rate_limit(&self, message: String, status: u16) -> ApiError {
        self.counters
            .silent_rate_limits
            .fetch_add(1, Ordering::Relaxed);
        ApiError::rate_limit(message).with_status(status)
    }

    // Maps status, encoding and body onto either the payload text or a classified error
    fn inspect(&self, response: HttpResponse) -> Result<String, ApiError> {
        let status = response.status;
        match status {
            301 | 302 | 303 | 307 | 308 => {
                return Err(self.silent_rate_limit(
                    format!("upstream redirected ({status}), treating as throttled"),
                    status,
                ))
            }
            202 => {
                return Err(ApiError::rate_limit("upstream queued the request (202)")
                    .with_status(status)
                    .with_retry_after(response.retry_after.unwrap_or(QUEUED_RETRY_AFTER)))
            }
            429 => {
                let err = ApiError::rate_limit("upstream returned 429").with_status(status);
                return Err(match response.retry_after {
                    Some(after) => err.with_retry_after(after),
                    None => err,
                });
            }
            500..=599 => {
                return Err(ApiError::unavailable(format!("upstream returned {status}"))
                    .with_status(status))
            }
            200..=299 => {}
            _ => {
                return Err(
                    ApiError::new(FailureKind::Unknown, format!("unexpected status {status}"))
                        .with_status(status),
                )
            }
        }

        if response.body.is_empty() {
            return Err(self.silent_rate_limit("empty response body".to_string(), status));
        }

        let gzipped = response
            .content_encoding
            .as_deref()
            .map_or(false, |e| e.to_ascii_lowercase().contains("gzip"))
            || response.body.starts_with(&GZIP_MAGIC);

        let text = if gzipped {
            let mut decoded = String::new();
            GzDecoder::new(response.body.as_ref())
                .read_to_string(&mut decoded)
                .map_err(|e| ApiError::parse(format!("gzip decompression failed: {e}")))?;
            decoded
        } else {
            String::from_utf8_lossy(&response.body).into_owned()
        };

        if text.trim().is_empty() {
            return Err(self.silent_rate_limit("empty response body after decoding".to_string(), status));
        }
        Ok(text)
    }
}

// Token bucket driven by the worker; capacity is the burst limit
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    // Takes a token, or returns how long until one is available
    fn try_take(&mut self, rate: f64) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let wait = Duration::try_from_secs_f64((1.0 - self.tokens) / rate)
                .unwrap_or(MAX_TOKEN_WAIT)
                .min(MAX_TOKEN_WAIT);
            Some(wait)
        }
    }
}

struct Job {
    url: String,
    reply: oneshot::Sender<Result<String, ApiError>>,
}

async fn run_worker(shared: Arc<Shared>, burst_limit: u32, mut rx: mpsc::Receiver<Job>) {
    let mut bucket = TokenBucket::new(burst_limit);
    while let Some(job) = rx.recv().await {
        shared.queued.fetch_sub(1, Ordering::Relaxed);
        if job.reply.is_closed() {
            debug!(url = %job.url, "caller went away, skipping queued request");
            continue;
        }
        while let Some(wait) = bucket.try_take(shared.effective_rate()) {
            tokio::time::sleep(wait).await;
        }
        let result = shared.dispatch(&job.url).await;
        let _ = job.reply.send(result);
    }
    debug!("request queue closed, worker exiting");
}

// Must be created inside a tokio runtime; the worker stops when the client is dropped.
pub struct RateLimitedClient {
    base_url: String,
    sender: mpsc::Sender<Job>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl RateLimitedClient {
    pub fn new(config: ApiConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let (sender, rx) = mpsc::channel(config.queue_size.max(1));
        let shared = Arc::new(Shared {
            transport,
            counters: Counters::default(),
            queued: AtomicUsize::new(0),
            rate_multiplier: AtomicU64::new(1.0f64.to_bits()),
            requests_per_second: config.requests_per_second.max(MIN_REQUESTS_PER_SECOND),
            timeout: config.request_timeout,
        });
        let worker = tokio::spawn(run_worker(shared.clone(), config.burst_limit, rx));

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            sender,
            shared,
            worker,
        }
    }

    pub fn with_reqwest(config: ApiConfig) -> Result<Self, ApiError> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::new(config, transport))
    }

    pub async fn fetch(&self, path: &str, params: &[(&str, String)]) -> Result<String, ApiError> {
        let url = reqwest::Url::parse_with_params(&format!("{}/{}", self.base_url, path), params)
            .map_err(|e| {
                ApiError::validation(
                    format!("invalid request URL for {path}: {e}"),
                    "The request could not be built.",
                )
            })?;
        self.enqueue(url.to_string()).await
    }

    async fn enqueue(&self, url: String) -> Result<String, ApiError> {
        let (reply, response) = oneshot::channel();
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(Job { url, reply }).await.is_err() {
            self.shared.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(ApiError::unavailable("request worker is not running"));
        }
        response
            .await
            .map_err(|_| ApiError::new(FailureKind::Unknown, "request worker dropped the reply"))?
    }

    pub async fn search_raw(
        &self,
        query: &str,
        filter: TypeFilter,
        exact: bool,
    ) -> Result<String, ApiError> {
        let types = match filter {
            TypeFilter::All => "boardgame,boardgameexpansion",
            other => other.as_str(),
        };
        let mut params = vec![("query", query.to_string()), ("type", types.to_string())];
        if exact {
            params.push(("exact", "1".to_string()));
        }
        self.fetch("search", &params).await
    }

    pub async fn thing_raw(&self, ids: &[u64]) -> Result<String, ApiError> {
        let ids = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let params = [
            ("id", ids),
            ("stats", "1".to_string()),
            ("versions", "1".to_string()),
        ];
        self.fetch("thing", &params).await
    }

    pub async fn collection_raw(&self, username: &str) -> Result<String, ApiError> {
        let params = [
            ("username", username.to_string()),
            ("stats", "1".to_string()),
        ];
        self.fetch("collection", &params).await
    }

    pub fn set_rate_multiplier(&self, multiplier: f64) {
        let clamped = multiplier.clamp(MIN_RATE_MULTIPLIER, 1.0);
        self.shared
            .rate_multiplier
            .store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn rate_multiplier(&self) -> f64 {
        self.shared.rate_multiplier()
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.shared.counters;
        let sent = c.sent.load(Ordering::Relaxed);
        let total_ms = c.total_response_ms.load(Ordering::Relaxed);
        ClientStats {
            requests_sent: sent,
            requests_succeeded: c.succeeded.load(Ordering::Relaxed),
            requests_failed: c.failed.load(Ordering::Relaxed),
            silent_rate_limits: c.silent_rate_limits.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            average_response_time_ms: if sent == 0 {
                0.0
            } else {
                total_ms as f64 / sent as f64
            },
            queue_depth: self.shared.queued.load(Ordering::Relaxed),
            rate_multiplier: self.shared.rate_multiplier(),
            effective_requests_per_second: self.shared.effective_rate(),
        }
    }
}

impl Drop for RateLimitedClient {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

// Scriptable transport for tests and offline runs
pub mod mock_transport {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use parking_lot::Mutex;
    use std::{collections::VecDeque, io::Write};

    #[derive(Debug, Clone)]
    pub enum MockReply {
        Response(HttpResponse),
        Error(ApiError),
    }

    #[derive(Default)]
    pub struct MockTransport {
        replies: Mutex<VecDeque<MockReply>>,
        // Served once the queue is exhausted
        default_reply: Mutex<Option<MockReply>>,
        calls: Mutex<Vec<(String, Instant)>>,
        delay: Mutex<Duration>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, response: HttpResponse) {
            self.replies.lock().push_back(MockReply::Response(response));
        }

        pub fn push_error(&self, error: ApiError) {
            self.replies.lock().push_back(MockReply::Error(error));
        }

        pub fn set_default(&self, response: HttpResponse) {
            *self.default_reply.lock() = Some(MockReply::Response(response));
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(url, _)| url.clone()).collect()
        }

        pub fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, ApiError> {
            self.calls.lock().push((url.to_string(), Instant::now()));

            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let reply = self
                .replies
                .lock()
                .pop_front()
                .or_else(|| self.default_reply.lock().clone());
            match reply {
                Some(MockReply::Response(response)) => Ok(response),
                Some(MockReply::Error(error)) => Err(error),
                None => Err(ApiError::unavailable("mock transport has no reply queued")),
            }
        }
    }

    pub fn ok_xml(body: &str) -> HttpResponse {
        HttpResponse::new(200, body.to_string())
    }

    pub fn empty() -> HttpResponse {
        HttpResponse::new(200, Bytes::new())
    }

    pub fn status(code: u16) -> HttpResponse {
        HttpResponse::new(code, Bytes::new())
    }

    pub fn gzip(body: &str, with_header: bool) -> HttpResponse {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        // writing into a Vec cannot fail
        let _ = encoder.write_all(body.as_bytes());
        let compressed = encoder.finish().unwrap_or_default();
        HttpResponse {
            content_encoding: with_header.then(|| "gzip".to_string()),
            ..HttpResponse::new(200, compressed)
        }
    }
}
