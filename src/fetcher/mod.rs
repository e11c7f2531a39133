pub mod circuit_breaker;
pub mod pacer;

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::api::latency::LatencyStats;
use crate::config::{retry_backoff, FetcherPolicy};
use crate::error::{AppError, Result};

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use pacer::Pacer;

/// One outbound upstream call.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    /// Overrides the fetcher's default request timeout.
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RawPayload {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Wraps every upstream call behind the shared pacer and circuit breaker.
///
/// Transient failures (transport, timeout, 5xx, 429) are retried with exponential
/// backoff; each attempt passes through the breaker and the pacer again.
pub struct RateLimitedFetcher {
    client: reqwest::Client,
    pacer: Pacer,
    breaker: CircuitBreaker,
    latency: Arc<LatencyStats>,
    policy: FetcherPolicy,
}

impl RateLimitedFetcher {
    pub fn new(policy: FetcherPolicy, latency: Arc<LatencyStats>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()?;
        Ok(Self {
            client,
            pacer: Pacer::new(policy.pace_interval),
            breaker: CircuitBreaker::new(BreakerConfig::from(&policy)),
            latency,
            policy,
        })
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn fetch(&self, req: &FetchRequest) -> Result<RawPayload> {
        let mut schedule = retry_backoff(self.policy.retry_backoff);
        let mut attempt = 0u32;
        loop {
            match self.attempt(req).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let Some(wait) = schedule.next_backoff() else {
                        return Err(e);
                    };
                    attempt += 1;
                    warn!(
                        url = %req.url,
                        attempt,
                        "[FETCH] {e} (attempt {attempt}/{}), retrying in {wait:?}",
                        self.policy.max_retries,
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch and decode a JSON body. Malformed payloads surface as `AppError::Decode`.
    pub async fn fetch_json<T: DeserializeOwned>(&self, req: &FetchRequest) -> Result<T> {
        let payload = self.fetch(req).await?;
        let decoded = serde_json::from_slice(&payload.body)?;
        Ok(decoded)
    }

    async fn attempt(&self, req: &FetchRequest) -> Result<RawPayload> {
        if !self.breaker.admit() {
            debug!(url = %req.url, "[FETCH] rejected by open circuit");
            return Err(AppError::CircuitOpen);
        }
        self.pacer.acquire().await;

        let timeout = req.timeout.unwrap_or(self.policy.request_timeout);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, async {
            let resp = self.client.request(req.method.clone(), &req.url).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;
        let latency = started.elapsed();
        self.latency.record(latency);
        let latency_ms = latency.as_millis() as u64;

        match result {
            Err(_) => {
                self.breaker.record_failure();
                warn!(method = %req.method, url = %req.url, latency_ms, "[FETCH] {} {} timed out after {latency_ms}ms", req.method, req.url);
                Err(AppError::Timeout(req.url.clone()))
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!(method = %req.method, url = %req.url, latency_ms, "[FETCH] {} {} transport error: {e}", req.method, req.url);
                Err(AppError::Transport(e))
            }
            Ok(Ok((status, body))) => {
                let code = status.as_u16();
                if status.is_success() {
                    self.breaker.record_success();
                    debug!(method = %req.method, url = %req.url, status = code, latency_ms, "[FETCH] {} {} -> {code} in {latency_ms}ms", req.method, req.url);
                    return Ok(RawPayload { status: code, body: body.to_vec() });
                }
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    self.breaker.record_failure();
                } else {
                    // Upstream is reachable; a 4xx says nothing about its health.
                    self.breaker.record_success();
                }
                warn!(method = %req.method, url = %req.url, status = code, latency_ms, "[FETCH] {} {} -> {code} in {latency_ms}ms", req.method, req.url);
                Err(AppError::Upstream { status: code, url: req.url.clone() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::{http::StatusCode, routing::get, Router};

    fn fast_policy() -> FetcherPolicy {
        FetcherPolicy {
            pace_interval: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            breaker_window: Duration::from_secs(60),
            breaker_min_requests: 3,
            breaker_failure_ratio: 0.6,
            breaker_cooldown: Duration::from_secs(60),
            half_open_max_trials: 1,
            half_open_successes_to_close: 1,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn decodes_json_payload() {
        let app = Router::new().route("/ok", get(|| async { r#"{"value": 7}"# }));
        let base = serve(app).await;
        let fetcher = RateLimitedFetcher::new(fast_policy(), Arc::new(LatencyStats::new())).unwrap();

        #[derive(serde::Deserialize)]
        struct Body {
            value: u32,
        }
        let body: Body = fetcher.fetch_json(&FetchRequest::get(format!("{base}/ok"))).await.unwrap();
        assert_eq!(body.value, 7);
        assert_eq!(fetcher.latency.len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error_and_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/bad",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "not json"
                }
            }),
        );
        let base = serve(app).await;
        let fetcher = RateLimitedFetcher::new(fast_policy(), Arc::new(LatencyStats::new())).unwrap();

        let err = fetcher
            .fetch_json::<serde_json::Value>(&FetchRequest::get(format!("{base}/bad")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_trip_the_breaker() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/down",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let base = serve(app).await;
        let fetcher = RateLimitedFetcher::new(fast_policy(), Arc::new(LatencyStats::new())).unwrap();
        let req = FetchRequest::get(format!("{base}/down"));

        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream { status: 503, .. }));
        // one attempt + two retries
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.breaker_state(), BreakerState::Open);

        let err = fetcher.fetch(&req).await.unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let app = Router::new();
        let base = serve(app).await;
        let fetcher = RateLimitedFetcher::new(fast_policy(), Arc::new(LatencyStats::new())).unwrap();

        let err = fetcher.fetch(&FetchRequest::get(format!("{base}/missing"))).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream { status: 404, .. }));
        assert_eq!(fetcher.breaker_state(), BreakerState::Closed);
    }
}
