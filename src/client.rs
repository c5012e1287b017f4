//! Unified HTTP client for the instrument API.
//!
//! Combines [`BaseUrlResolver`] and [`RouteCatalog`]: callers either request
//! an explicit path or dispatch a cataloged operation by id. The resolved
//! base URL is detected lazily on first use and cached for the lifetime of
//! the client until [`UnifiedHttpClient::clear_base_url`] is called.
//!
//! # Example
//!
//! ```no_run
//! use vaonis_link::{config::HttpConfig, RequestOptions, RouteCatalog, UnifiedHttpClient};
//!
//! # async fn run() -> vaonis_link::Result<()> {
//! let client = UnifiedHttpClient::new(&HttpConfig::default(), RouteCatalog::builtin()?)?;
//! let status = client.call_operation("appGetStatus", RequestOptions::default()).await?;
//! println!("{}", status);
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use reqwest::{Method, Url};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::auth::{AuthContext, build_authorization_header};
use crate::config::HttpConfig;
use crate::discovery::{BaseUrlResolver, HEALTH_PATH};
use crate::error::{Result, VaonisError};
use crate::image::looks_like_image;
use crate::keys::KeyMaterial;
use crate::payload::{Payload, format_binary, format_payload};
use crate::routes::RouteCatalog;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

const BODY_EXCERPT_CHARS: usize = 200;

/// Per-call options for [`UnifiedHttpClient::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Full `Authorization` header value.
    pub auth: Option<String>,
    /// Query parameters; array values repeat the key.
    pub params: Vec<(String, Value)>,
    /// Serialized as JSON. Takes precedence over `body`.
    pub json_body: Option<Value>,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn auth(mut self, header: impl Into<String>) -> Self {
        self.auth = Some(header.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Flattens parameters into query pairs. Arrays become repeated keys, nulls
/// are dropped, strings are used verbatim and objects are JSON-encoded.
pub fn query_pairs(params: &[(String, Value)]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(rendered) = scalar_to_query(item) {
                        pairs.push((key.clone(), rendered));
                    }
                }
            }
            other => {
                if let Some(rendered) = scalar_to_query(other) {
                    pairs.push((key.clone(), rendered));
                }
            }
        }
    }
    pairs
}

fn scalar_to_query(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

pub struct UnifiedHttpClient<T = ReqwestTransport> {
    transport: T,
    resolver: BaseUrlResolver,
    catalog: RouteCatalog,
    timeout: Duration,
    base_url: OnceCell<String>,
    log_payloads: bool,
    log_payload_limit: usize,
}

impl UnifiedHttpClient<ReqwestTransport> {
    pub fn new(config: &HttpConfig, catalog: RouteCatalog) -> Result<Self> {
        let resolver = BaseUrlResolver::new(
            config.host.clone(),
            config.port,
            config.api_base_path.clone(),
            config.prefixes.clone(),
        );
        let mut client = Self::with_transport(ReqwestTransport::new()?, resolver, catalog, config.timeout());
        client.log_payloads = config.log_payloads;
        client.log_payload_limit = config.log_payload_limit;
        Ok(client)
    }
}

impl<T: HttpTransport> UnifiedHttpClient<T> {
    pub fn with_transport(
        transport: T,
        resolver: BaseUrlResolver,
        catalog: RouteCatalog,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            resolver,
            catalog,
            timeout,
            base_url: OnceCell::new(),
            log_payloads: true,
            log_payload_limit: 4000,
        }
    }

    pub fn catalog(&self) -> &RouteCatalog {
        &self.catalog
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cached base URL, if detection already ran.
    pub fn resolved_base_url(&self) -> Option<&str> {
        self.base_url.get().map(String::as_str)
    }

    /// Pins the base URL, skipping detection.
    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = OnceCell::new_with(Some(base_url.into().trim_end_matches('/').to_string()));
    }

    /// Forgets the cached base URL; the next call detects again.
    pub fn clear_base_url(&mut self) {
        self.base_url.take();
    }

    /// Returns the cached base URL or detects and caches one.
    pub async fn base_url(&self) -> Result<&str> {
        self.base_url
            .get_or_try_init(|| self.detect_base_url())
            .await
            .map(String::as_str)
    }

    /// Checks every configured prefix without touching the cache.
    pub async fn detect_base_url(&self) -> Result<String> {
        self.resolver.detect(|url| self.check_health(url)).await
    }

    async fn check_health(&self, url: String) -> bool {
        let Ok(url) = Url::parse(&url) else {
            return false;
        };
        match tokio::time::timeout(self.timeout, self.transport.send(HttpRequest::get(url))).await {
            Ok(Ok(response)) => response.is_success(),
            Ok(Err(e)) => {
                debug!(error = %e, "Health check failed");
                false
            }
            Err(_) => {
                debug!("Health check timed out");
                false
            }
        }
    }

    /// Issues `method path` relative to the base URL and decodes the body.
    pub async fn request(&self, method: &str, path: &str, options: RequestOptions) -> Result<Payload> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| VaonisError::InvalidUrl(format!("bad method '{}'", method)))?;
        let url = join_url(self.base_url().await?, path)?;
        let response = self.execute(build_request(method, url, options)).await?;

        if !response.is_success() {
            return Err(http_error(&response));
        }
        Ok(decode(&response))
    }

    /// Looks up `operation_id` and delegates to [`Self::request`]. Unknown ids
    /// fail before any network activity.
    pub async fn call_operation(&self, operation_id: &str, options: RequestOptions) -> Result<Payload> {
        let route = self
            .catalog
            .lookup(operation_id)
            .ok_or_else(|| VaonisError::UnknownOperation(operation_id.to_string()))?;
        self.request(&route.method, &route.path, options).await
    }

    /// Downloads image bytes from an absolute URL or a path under the base
    /// URL. A non-2xx status is tolerated when the body still looks like an
    /// image.
    pub async fn download_image(
        &self,
        url_or_path: &str,
        options: RequestOptions,
    ) -> Result<Vec<u8>> {
        let url = if url_or_path.starts_with("http://") || url_or_path.starts_with("https://") {
            Url::parse(url_or_path).map_err(|_| VaonisError::InvalidUrl(url_or_path.to_string()))?
        } else {
            join_url(self.base_url().await?, url_or_path)?
        };
        let response = self.execute(build_request(Method::GET, url, options)).await?;

        if response.is_success() || looks_like_image(&response.body, response.content_type.as_deref()) {
            if !response.is_success() {
                warn!(status = response.status, "Accepting image body despite error status");
            }
            return Ok(response.body);
        }
        Err(http_error(&response))
    }

    /// Unauthenticated status snapshot.
    pub async fn get_status(&self) -> Result<Value> {
        Ok(self.request("GET", HEALTH_PATH, RequestOptions::default()).await?.into_json())
    }

    /// Fetches a fresh challenge and signs it.
    pub async fn authorize(&self, key: &KeyMaterial) -> Result<String> {
        let status = self.get_status().await?;
        let ctx = AuthContext::from_status(&status)?;
        build_authorization_header(&ctx, key)
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = request.method.clone();
        let url = request.url.to_string();
        info!(
            %method,
            %url,
            auth = request.header("authorization").map(|_| "<redacted>"),
            body_bytes = request.body.as_ref().map(Vec::len),
            "HTTP request"
        );
        if self.log_payloads {
            if let Some(body) = &request.body {
                debug!(payload = %format_payload(&String::from_utf8_lossy(body), self.log_payload_limit), "HTTP request body");
            }
        }

        let start = Instant::now();
        let response = match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(%method, %url, error = %e, "HTTP error");
                return Err(e);
            }
            Err(_) => {
                warn!(%method, %url, timeout_ms = self.timeout.as_millis() as u64, "HTTP timeout");
                return Err(VaonisError::Timeout);
            }
        };

        info!(
            %method,
            %url,
            status = response.status,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            bytes = response.body.len(),
            "HTTP response"
        );
        if self.log_payloads {
            let content_type = response.content_type.as_deref().unwrap_or_default();
            let rendered = if content_type.starts_with("image/") || content_type.contains("application/octet-stream") {
                format_binary(response.body.len())
            } else {
                format_payload(&String::from_utf8_lossy(&response.body), self.log_payload_limit)
            };
            debug!(%method, %url, payload = %rendered, "HTTP response body");
        }

        Ok(response)
    }
}

/// Applies query parameters, headers, auth and body from `options`.
fn build_request(method: Method, mut url: Url, options: RequestOptions) -> HttpRequest {
    let pairs = query_pairs(&options.params);
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs.iter());
    }

    let mut headers = options.headers;
    if let Some(auth) = options.auth {
        headers.push(("Authorization".to_string(), auth));
    }

    let body = match (options.json_body, options.body) {
        (Some(json), _) => {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            Some(json.to_string().into_bytes())
        }
        (None, raw) => raw,
    };

    HttpRequest {
        method,
        url,
        headers,
        body,
    }
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|_| VaonisError::InvalidUrl(joined))
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let mime = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

fn decode(response: &HttpResponse) -> Payload {
    let text = String::from_utf8_lossy(&response.body).into_owned();
    if is_json(response.content_type.as_deref()) {
        match serde_json::from_str(&text) {
            Ok(value) => return Payload::Json(value),
            Err(e) => warn!(error = %e, "Body declared as JSON but did not parse, returning text"),
        }
    }
    Payload::Text(text)
}

fn http_error(response: &HttpResponse) -> VaonisError {
    VaonisError::Http {
        status: response.status,
        status_text: response.status_text.clone(),
        body_excerpt: String::from_utf8_lossy(&response.body)
            .chars()
            .take(BODY_EXCERPT_CHARS)
            .collect(),
    }
}
