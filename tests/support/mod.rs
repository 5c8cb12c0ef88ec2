//! Shared fixtures for behavior tests: a scripted upstream and a fast,
//! deterministic extraction config.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biofetch_core::{
    BatchExtractor, CacheBackend, CacheBackendKind, CacheConfig, CacheContext, ClientFactory,
    ExtractionConfig, FetchError, HttpClient, HttpRequest, HttpResponse, RateLimitConfig,
    RetryConfig,
};
use serde_json::{json, Value};

pub const BASE_URL: &str = "https://chembl.test/chembl/api/data";
pub const ID_PARAM: &str = "document_chembl_id__in";
pub const ID_FIELD: &str = "document_chembl_id";

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, FetchError> + Send + Sync;

/// In-memory upstream that records every request and answers through a
/// handler closure.
pub struct FakeUpstream {
    handler: Box<Handler>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeUpstream {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, FetchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Upstream that returns one document per requested identifier.
    pub fn serving_documents() -> Arc<Self> {
        Self::new(|request| Ok(documents_page(&requested_ids(request), None)))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl HttpClient for FakeUpstream {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let response = (self.handler)(&request);
            self.requests.lock().expect("requests lock").push(request);
            response
        })
    }
}

/// Identifiers carried in the filter parameter of `request`.
pub fn requested_ids(request: &HttpRequest) -> Vec<String> {
    request
        .query
        .iter()
        .find(|(name, _)| name == ID_PARAM)
        .map(|(_, value)| value.split(',').map(str::to_owned).collect())
        .unwrap_or_default()
}

pub fn document(id: &str) -> Value {
    json!({
        ID_FIELD: id,
        "title": format!("Document {id}"),
        "year": 2024,
    })
}

/// Envelope page in the `documents` + `page_meta` shape.
pub fn documents_page(ids: &[String], next: Option<&str>) -> HttpResponse {
    let documents: Vec<Value> = ids.iter().map(|id| document(id)).collect();
    HttpResponse::ok_json(
        json!({
            "documents": documents,
            "page_meta": {"next": next, "total_count": ids.len()},
        })
        .to_string(),
    )
}

/// Config with millisecond backoff and an effectively unlimited rate budget.
pub fn config() -> ExtractionConfig {
    ExtractionConfig {
        source: String::from("chembl"),
        base_url: String::from(BASE_URL),
        endpoint: String::from("document.json"),
        id_param: String::from(ID_PARAM),
        id_field: String::from(ID_FIELD),
        items_key: Some(String::from("documents")),
        identity: CacheContext::new("document", "1.0.0", "chembl_34"),
        cache: CacheConfig {
            backend: CacheBackendKind::Memory,
            ..CacheConfig::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        rate_limit: RateLimitConfig {
            requests_per_second: 1_000.0,
            burst: 100,
        },
        ..ExtractionConfig::default()
    }
}

/// Extractor wired to `upstream` with its own breaker and limiter registry.
pub fn extractor(
    config: ExtractionConfig,
    upstream: Arc<FakeUpstream>,
    cache: Option<Arc<dyn CacheBackend>>,
) -> BatchExtractor {
    let factory = ClientFactory::default().with_http_client(upstream);
    let client = factory.client_for(&config).expect("client for valid config");
    BatchExtractor::new(config, client, cache).expect("valid config")
}

pub fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|id| (*id).to_owned()).collect()
}
