//! Resilient upstream access.
//!
//! [`ResilientClient`] wraps one logical GET in the full protection stack:
//!
//! ```text
//! circuit check -> rate-limit acquire -> HTTP GET -> classify
//!       ^                                              |
//!       +---------- retry policy sleeps <--- failure --+
//! ```
//!
//! The breaker is consulted before a rate-limit token is taken so suppressed
//! calls never spend budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use time::OffsetDateTime;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakers};
use crate::config::ExtractionConfig;
use crate::error::{ConfigError, FetchError};
use crate::http_client::{
    HttpClient, HttpConfig, HttpRequest, HttpResponse, ReqwestHttpClient, SessionRegistry,
};
use crate::pagination::PageResolver;
use crate::payload::ResponsePayload;
use crate::retry::{parse_retry_after, RetryDecision, RetryPolicy};
use crate::source::SourceId;
use crate::throttling::{RateLimiter, RateLimiters};

/// Longest slice of an error body carried into a status error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Network activity counted by the caller across requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTally {
    /// HTTP attempts actually sent, retries included.
    pub api_calls: u64,
    /// Backoff sleeps taken.
    pub retries: u64,
}

/// Upstream client for one source.
pub struct ResilientClient {
    source: SourceId,
    resolver: PageResolver,
    http: Arc<dyn HttpClient>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout_ms: u64,
    max_pages: usize,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("source", &self.source)
            .field("base_url", &self.resolver.base_url())
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    pub fn new(
        source: SourceId,
        resolver: PageResolver,
        http: Arc<dyn HttpClient>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            resolver,
            http,
            limiter,
            breaker,
            retry,
            timeout_ms: 30_000,
            max_pages: 100,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Per-request timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &PageResolver {
        &self.resolver
    }

    /// GET `path` (relative to the base URL) and decode the JSON body.
    ///
    /// Retries according to the policy; after the last attempt the final
    /// error is returned. An open breaker fails fast with
    /// [`FetchError::CircuitOpen`] without touching the network.
    pub async fn get_json(
        &self,
        path: &str,
        params: &[(String, String)],
        tally: &mut RequestTally,
    ) -> Result<Value, FetchError> {
        let url = self.resolver.absolute(path);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if !self.breaker.should_allow_call() {
                tracing::warn!(source = %self.source, "circuit open; call suppressed");
                return Err(FetchError::CircuitOpen {
                    upstream: self.source.clone(),
                });
            }

            self.limiter.acquire().await;

            let request = params.iter().fold(
                HttpRequest::get(url.as_str())
                    .with_timeout_ms(self.timeout_ms)
                    .with_header("accept", "application/json"),
                |request, (name, value)| request.with_query(name.as_str(), value.as_str()),
            );
            tally.api_calls += 1;
            tracing::debug!(source = %self.source, url = %request.full_url(), attempt, "upstream request");

            let outcome = match self.http.execute(request).await {
                Ok(response) => interpret_response(response),
                Err(error) => Err(error),
            };

            let error = match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.counts_against_upstream() && self.breaker.record_failure() {
                tracing::warn!(
                    source = %self.source,
                    failures = self.breaker.consecutive_failures(),
                    holdoff_s = self.breaker.config().holdoff.as_secs_f64(),
                    "circuit breaker opened"
                );
            }

            match self.retry.decide(attempt, &error) {
                RetryDecision::Abort => {
                    tracing::warn!(
                        source = %self.source,
                        attempt,
                        kind = %error.kind(),
                        %error,
                        "upstream request failed"
                    );
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        source = %self.source,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying upstream request"
                    );
                    tally.retries += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch `path` and every page reachable through `page_meta.next`.
    ///
    /// Cursors carry the complete query, so `params` only apply to the first
    /// page. Pagination stops with a decode error after `max_pages` pages or
    /// when a cursor repeats.
    pub async fn fetch_all_pages(
        &self,
        path: &str,
        params: &[(String, String)],
        items_key: Option<&str>,
        tally: &mut RequestTally,
    ) -> Result<Vec<ResponsePayload>, FetchError> {
        let mut pages = Vec::new();
        let mut current = path.to_owned();
        let mut current_params = params.to_vec();
        let mut seen = HashSet::from([current.clone()]);

        loop {
            let value = self.get_json(&current, &current_params, tally).await?;
            let payload = ResponsePayload::from_value(value, items_key)?;
            let next = payload
                .next_cursor()
                .and_then(|cursor| self.resolver.resolve(cursor, &current));
            pages.push(payload);

            let Some(next) = next else {
                return Ok(pages);
            };
            if pages.len() >= self.max_pages {
                return Err(FetchError::decode(format!(
                    "pagination exceeded {} pages at {next}",
                    self.max_pages
                )));
            }
            if !seen.insert(next.clone()) {
                return Err(FetchError::decode(format!(
                    "pagination cursor repeated: {next}"
                )));
            }

            tracing::debug!(source = %self.source, page = pages.len() + 1, next = %next, "following page cursor");
            current = next;
            current_params.clear();
        }
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy { status: u16, latency: Duration },
    CircuitOpen,
    RateLimited { retry_after: Duration },
    Failed(FetchError),
}

impl ProbeOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy { .. } => "healthy",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Failed(_) => "failed",
        }
    }

    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

impl ResilientClient {
    /// One attempt, no retries, rejecting instead of waiting when the rate
    /// budget is spent. The result is recorded on the breaker like any call.
    pub async fn probe(&self, path: &str, params: &[(String, String)]) -> ProbeOutcome {
        if !self.breaker.should_allow_call() {
            return ProbeOutcome::CircuitOpen;
        }
        if let Err(limited) = self.limiter.try_acquire() {
            return ProbeOutcome::RateLimited {
                retry_after: limited.retry_after,
            };
        }

        let request = params.iter().fold(
            HttpRequest::get(self.resolver.absolute(path)).with_timeout_ms(self.timeout_ms),
            |request, (name, value)| request.with_query(name.as_str(), value.as_str()),
        );
        let started = Instant::now();
        let outcome = match self.http.execute(request).await {
            Ok(response) => {
                let status = response.status;
                interpret_response(response).map(|_| status)
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(status) => {
                self.breaker.record_success();
                ProbeOutcome::Healthy {
                    status,
                    latency: started.elapsed(),
                }
            }
            Err(error) => {
                if error.counts_against_upstream() {
                    self.breaker.record_failure();
                }
                ProbeOutcome::Failed(error)
            }
        }
    }
}

fn interpret_response(response: HttpResponse) -> Result<Value, FetchError> {
    if !response.is_success() {
        let retry_after = response
            .header("retry-after")
            .and_then(|value| parse_retry_after(value, OffsetDateTime::now_utc()));
        let message: String = response.body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
        return Err(FetchError::HttpStatus {
            status: response.status,
            message: if message.is_empty() {
                String::from("empty response body")
            } else {
                message
            },
            retry_after,
        });
    }

    serde_json::from_str(&response.body)
        .map_err(|error| FetchError::decode(format!("response is not valid JSON: {error}")))
}

/// Owns the process-wide breaker, limiter and session registries and builds
/// clients that share them.
pub struct ClientFactory {
    sessions: Arc<SessionRegistry>,
    breakers: CircuitBreakers,
    limiters: RateLimiters,
    transport: Option<Arc<dyn HttpClient>>,
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(Arc::new(SessionRegistry::default()))
    }
}

impl ClientFactory {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            sessions,
            breakers: CircuitBreakers::default(),
            limiters: RateLimiters::new(),
            transport: None,
        }
    }

    /// Factory whose reqwest sessions use the given connection settings.
    pub fn from_http(config: &HttpConfig) -> Self {
        Self::new(Arc::new(SessionRegistry::new(config.clone())))
    }

    /// Route every client through `transport` instead of a reqwest session.
    pub fn with_http_client(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn client_for(&self, config: &ExtractionConfig) -> Result<ResilientClient, ConfigError> {
        let source = config.source_id()?;
        let resolver = config.resolver()?;
        let http: Arc<dyn HttpClient> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(ReqwestHttpClient::new(
                Arc::clone(&self.sessions),
                source.as_str(),
            )),
        };

        Ok(ResilientClient::new(
            source.clone(),
            resolver,
            http,
            self.limiters.for_source(&source, config.rate_limit),
            self.breakers.for_source_with(&source, config.circuit_breaker),
            RetryPolicy::new(config.retry.clone()),
        )
        .with_timeout_ms(config.http.timeout_ms)
        .with_max_pages(config.max_pages))
    }

    /// Close every HTTP session. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        self.sessions.shutdown()
    }
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("sessions", &self.sessions.len())
            .field("breakers", &self.breakers.states())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::retry::RetryConfig;
    use crate::throttling::RateLimitConfig;

    #[derive(Default)]
    struct ScriptedHttpClient {
        responses: Mutex<VecDeque<Result<HttpResponse, FetchError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttpClient {
        fn new(responses: Vec<Result<HttpResponse, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().expect("lock").clone()
        }
    }

    impl HttpClient for ScriptedHttpClient {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, FetchError>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().expect("lock").push(request);
                self.responses
                    .lock()
                    .expect("lock")
                    .pop_front()
                    .unwrap_or_else(|| Err(FetchError::transport("script exhausted")))
            })
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        }
    }

    fn client(
        http: Arc<ScriptedHttpClient>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
    ) -> ResilientClient {
        ResilientClient::new(
            SourceId::parse("chembl").expect("valid"),
            PageResolver::new("https://example.test/chembl/api/data", "/api/data").expect("valid"),
            http,
            Arc::new(RateLimiter::new(RateLimitConfig {
                requests_per_second: 1_000.0,
                burst: 10,
            })),
            Arc::new(CircuitBreaker::new(breaker)),
            RetryPolicy::new(retry),
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let http = Arc::new(ScriptedHttpClient::new(vec![
            Ok(HttpResponse::with_status(503, "maintenance")),
            Err(FetchError::timeout("read timed out")),
            Ok(HttpResponse::ok_json(r#"[{"id": 1}]"#)),
        ]));
        let client = client(http.clone(), fast_retry(3), CircuitBreakerConfig::default());
        let mut tally = RequestTally::default();

        let value = client
            .get_json("/molecule.json", &[], &mut tally)
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, json!([{"id": 1}]));
        assert_eq!(tally, RequestTally { api_calls: 3, retries: 2 });
        assert_eq!(client.breaker().consecutive_failures(), 0);
        assert_eq!(http.requests()[0].url, "https://example.test/chembl/api/data/molecule.json");
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_error() {
        let http = Arc::new(ScriptedHttpClient::new(vec![
            Ok(HttpResponse::with_status(500, "boom")),
            Ok(HttpResponse::with_status(502, "bad gateway")),
            Ok(HttpResponse::with_status(504, "gateway timeout")),
            Ok(HttpResponse::ok_json("[]")),
        ]));
        let client = client(http.clone(), fast_retry(3), CircuitBreakerConfig::default());
        let mut tally = RequestTally::default();

        let error = client
            .get_json("/molecule.json", &[], &mut tally)
            .await
            .expect_err("retries exhausted");

        assert!(matches!(error, FetchError::HttpStatus { status: 504, .. }));
        assert_eq!(http.requests().len(), 3);
        assert_eq!(tally.retries, 2);
    }

    #[tokio::test]
    async fn client_errors_abort_without_tripping_the_breaker() {
        let http = Arc::new(ScriptedHttpClient::new(vec![Ok(HttpResponse::with_status(
            400,
            "bad filter",
        ))]));
        let client = client(
            http.clone(),
            fast_retry(3),
            CircuitBreakerConfig {
                failure_threshold: 1,
                holdoff: Duration::from_secs(60),
            },
        );
        let mut tally = RequestTally::default();

        let error = client
            .get_json("/molecule.json", &[], &mut tally)
            .await
            .expect_err("bad request");

        assert!(matches!(error, FetchError::HttpStatus { status: 400, .. }));
        assert_eq!(tally.api_calls, 1);
        assert!(client.breaker().should_allow_call());
    }

    #[tokio::test]
    async fn retry_after_header_is_parsed_into_the_error() {
        let http = Arc::new(ScriptedHttpClient::new(vec![Ok(HttpResponse::with_status(
            429, "",
        )
        .with_header("Retry-After", "5"))]));
        let client = client(http, RetryConfig::no_retry(), CircuitBreakerConfig::default());

        let error = client
            .get_json("/molecule.json", &[], &mut RequestTally::default())
            .await
            .expect_err("no retries configured");

        assert_eq!(error.retry_after(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn unrepresentable_retry_after_is_dropped() {
        let http = Arc::new(ScriptedHttpClient::new(vec![Ok(HttpResponse::with_status(
            503, "",
        )
        .with_header("Retry-After", "1e30"))]));
        let client = client(http, RetryConfig::no_retry(), CircuitBreakerConfig::default());

        let error = client
            .get_json("/molecule.json", &[], &mut RequestTally::default())
            .await
            .expect_err("no retries configured");

        assert_eq!(error.retry_after(), None);
    }

    #[tokio::test]
    async fn follows_page_cursors_until_exhausted() {
        let http = Arc::new(ScriptedHttpClient::new(vec![
            Ok(HttpResponse::ok_json(
                json!({
                    "molecules": [{"molecule_chembl_id": "CHEMBL1"}],
                    "page_meta": {"next": "/chembl/api/data/molecule.json?limit=1&offset=1"}
                })
                .to_string(),
            )),
            Ok(HttpResponse::ok_json(
                json!({
                    "molecules": [{"molecule_chembl_id": "CHEMBL2"}],
                    "page_meta": {"next": null}
                })
                .to_string(),
            )),
        ]));
        let client = client(http.clone(), fast_retry(1), CircuitBreakerConfig::default());
        let mut tally = RequestTally::default();
        let params = vec![(String::from("limit"), String::from("1"))];

        let pages = client
            .fetch_all_pages("/molecule.json", &params, Some("molecules"), &mut tally)
            .await
            .expect("two pages");

        assert_eq!(pages.len(), 2);
        assert_eq!(tally.api_calls, 2);
        let requests = http.requests();
        assert_eq!(
            requests[0].full_url(),
            "https://example.test/chembl/api/data/molecule.json?limit=1"
        );
        assert_eq!(
            requests[1].full_url(),
            "https://example.test/chembl/api/data/molecule.json?limit=1&offset=1"
        );
    }

    #[tokio::test]
    async fn repeated_cursor_stops_pagination() {
        let page = json!({
            "items": [],
            "page_meta": {"next": "/chembl/api/data/molecule.json?offset=0"}
        })
        .to_string();
        let http = Arc::new(ScriptedHttpClient::new(vec![
            Ok(HttpResponse::ok_json(page.clone())),
            Ok(HttpResponse::ok_json(page.clone())),
            Ok(HttpResponse::ok_json(page)),
        ]));
        let client = client(http, fast_retry(1), CircuitBreakerConfig::default());

        let error = client
            .fetch_all_pages("/molecule.json", &[], None, &mut RequestTally::default())
            .await
            .expect_err("cursor loops");

        assert!(error.to_string().contains("repeated"));
    }

    #[tokio::test]
    async fn probe_rejects_instead_of_waiting() {
        let http = Arc::new(ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json("[]"))]));
        let client = ResilientClient::new(
            SourceId::parse("chembl").expect("valid"),
            PageResolver::new("https://example.test/chembl/api/data", "/api/data").expect("valid"),
            http.clone(),
            Arc::new(RateLimiter::new(RateLimitConfig {
                requests_per_second: 0.1,
                burst: 1,
            })),
            Arc::new(CircuitBreaker::default()),
            RetryPolicy::default(),
        );

        let first = client.probe("/status", &[]).await;
        assert!(first.is_healthy(), "{first:?}");

        let second = client.probe("/status", &[]).await;
        assert!(matches!(second, ProbeOutcome::RateLimited { .. }));
        assert_eq!(http.requests().len(), 1);
    }

    #[test]
    fn factory_shares_breakers_per_source() {
        let http: Arc<dyn HttpClient> = Arc::new(ScriptedHttpClient::default());
        let factory = ClientFactory::default().with_http_client(http);
        let config = ExtractionConfig {
            source: String::from("chembl"),
            base_url: String::from("https://example.test/chembl/api/data"),
            ..ExtractionConfig::default()
        };

        let first = factory.client_for(&config).expect("client");
        let second = factory.client_for(&config).expect("client");
        first.breaker().record_failure();
        assert_eq!(second.breaker().consecutive_failures(), 1);
        assert!(factory.sessions().is_empty());
    }

    #[test]
    fn factory_sessions_use_the_configured_http_settings() {
        let http = HttpConfig {
            timeout_ms: 5_000,
            connect_timeout_ms: 750,
            user_agent: String::from("chembl-loader/2.1"),
        };
        let factory = ClientFactory::from_http(&http);
        let config = ExtractionConfig {
            source: String::from("chembl"),
            base_url: String::from("https://example.test/chembl/api/data"),
            http: http.clone(),
            ..ExtractionConfig::default()
        };

        let client = factory.client_for(&config).expect("client");

        assert_eq!(factory.sessions().config(), &http);
        assert_eq!(client.timeout_ms(), 5_000);
        factory.sessions().session("chembl").expect("session builds");
        assert_eq!(factory.sessions().len(), 1);
    }
}
