use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Transport timeouts and identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: format!("biofetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// GET request issued by the resilient client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            timeout_ms: 30_000,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// URL with the query parameters percent-encoded and appended. Existing
    /// query strings (pagination cursors carry one) are extended, not replaced.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }

        let encoded = self
            .query
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{encoded}", self.url)
    }
}

/// HTTP response returned by a transport. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport contract. Non-2xx responses are returned as `Ok`; only failures
/// to obtain a response at all are errors.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, FetchError>> + Send + 'a>>;
}

/// Registry of every HTTP session created by the process, one per worker key.
///
/// Sessions are pooled `reqwest::Client`s; keeping one per source avoids
/// connection-pool contention between sources. [`shutdown`](Self::shutdown)
/// drops them all and refuses to create new ones.
#[derive(Debug)]
pub struct SessionRegistry {
    config: HttpConfig,
    sessions: Mutex<HashMap<String, reqwest::Client>>,
    closed: AtomicBool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(HttpConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Session for `key`, created on first use.
    pub fn session(&self, key: &str) -> Result<reqwest::Client, FetchError> {
        if self.is_closed() {
            return Err(FetchError::transport("http session registry is shut down"));
        }

        let mut sessions = self
            .sessions
            .lock()
            .expect("session registry lock is not poisoned");
        if let Some(client) = sessions.get(key) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .build()
            .map_err(|error| FetchError::transport(format!("failed to build http client: {error}")))?;
        sessions.insert(key.to_owned(), client.clone());
        tracing::debug!(session = key, "created http session");
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock is not poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every session. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut sessions = self
            .sessions
            .lock()
            .expect("session registry lock is not poisoned");
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            tracing::info!(sessions = count, "closed http sessions");
        }
        count
    }
}

/// Production HTTP client backed by a registry session.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    registry: Arc<SessionRegistry>,
    session_key: String,
}

impl ReqwestHttpClient {
    pub fn new(registry: Arc<SessionRegistry>, session_key: impl Into<String>) -> Self {
        Self {
            registry,
            session_key: session_key.into(),
        }
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.registry.session(&self.session_key)?;
            let mut builder = client
                .get(request.full_url())
                .timeout(Duration::from_millis(request.timeout_ms));

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let response = builder.send().await.map_err(classify_reqwest_error)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
                })
                .collect();
            let body = response.text().await.map_err(classify_reqwest_error)?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(format!("request timeout: {error}"))
    } else if is_name_resolution_failure(&error) {
        FetchError::name_resolution(error_chain(&error))
    } else if error.is_connect() {
        FetchError::transport(format!("connection failed: {}", error_chain(&error)))
    } else if error.is_decode() || error.is_body() {
        FetchError::transport(format!("failed to read response body: {error}"))
    } else {
        FetchError::transport(format!("request failed: {error}"))
    }
}

/// reqwest has no dedicated DNS flag; the resolver error is somewhere in the
/// source chain of a connect error.
fn is_name_resolution_failure(error: &reqwest::Error) -> bool {
    if !error.is_connect() {
        return false;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(inner) = source {
        if looks_like_dns_error(&inner.to_string()) {
            return true;
        }
        source = inner.source();
    }
    false
}

fn looks_like_dns_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ]
    .iter()
    .any(|marker| message.contains(marker))
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
