use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// HTTP methods used against the metering API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Credential applied to outgoing HTTP requests.
///
/// How the credential was obtained is the caller's business; the transport only
/// attaches it.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Header { name: String, value: String },
}

impl HttpAuth {
    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
            Self::Header { name, value } => {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
    }
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
        }
    }
}

/// One outbound attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
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

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query parameters as a JSON object, for logging and cache keys.
    ///
    /// A repeated name maps to an array of its values in request order.
    pub fn query_value(&self) -> Value {
        let mut params = serde_json::Map::new();
        for (name, value) in &self.query {
            let value = Value::String(value.clone());
            match params.get_mut(name) {
                None => {
                    params.insert(name.clone(), value);
                }
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
        Value::Object(params)
    }
}

/// Response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Transport failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Connect, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Other, message)
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, HttpErrorKind::Timeout)
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Transport contract. Implementations must be safe to share across workers.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Connection pool sizing for [`ReqwestHttpClient`].
///
/// reqwest keeps one pool per host and has no cap on the number of host pools, so
/// `pool_connections` is accepted for configuration compatibility and reported in
/// logs but bounds nothing. `pool_maxsize` caps idle connections per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of distinct hosts expected to keep warm connections for. Informational.
    pub pool_connections: usize,
    /// Idle connections kept per host.
    pub pool_maxsize: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_connections: 10,
            pool_maxsize: 20,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Production HTTP client on top of a shared, pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
    pool: Option<PoolConfig>,
}

impl ReqwestHttpClient {
    pub fn new(pool: PoolConfig) -> Result<Self, HttpError> {
        let max_idle_per_host = pool.pool_maxsize.max(1);
        let client = reqwest::Client::builder()
            .user_agent(concat!("meterguard/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(pool.idle_timeout)
            .build()
            .map_err(|e| HttpError::other(format!("failed to build http client: {e}")))?;

        tracing::debug!(
            pool_connections = pool.pool_connections,
            pool_maxsize = max_idle_per_host,
            "http connection pool configured"
        );

        Ok(Self {
            client: Arc::new(client),
            pool: Some(PoolConfig {
                pool_maxsize: max_idle_per_host,
                ..pool
            }),
        })
    }

    /// Create a ReqwestHttpClient with a custom reqwest::Client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
            pool: None,
        }
    }

    /// Pool settings the client was built with; `None` for a caller-supplied client.
    pub const fn pool_config(&self) -> Option<PoolConfig> {
        self.pool
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };

            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = builder.timeout(request.timeout);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::timeout(format!("request timeout: {e}"))
                } else if e.is_connect() {
                    HttpError::connect(format!("connection failed: {e}"))
                } else {
                    HttpError::other(format!("request failed: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_owned(), value.to_owned()))
                })
                .collect();
            let body = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::timeout(format!("timed out reading response body: {e}"))
                } else {
                    HttpError::other(format!("failed to read response body: {e}"))
                }
            })?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_auth_populates_authorization_header() {
        let request = HttpRequest::post("https://example.test/reporting/traffic")
            .with_auth(&HttpAuth::BearerToken(String::from("token-123")));

        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer token-123")
        );
    }

    #[test]
    fn custom_header_auth_preserves_name_and_value() {
        let request = HttpRequest::get("https://example.test/").with_auth(&HttpAuth::Header {
            name: String::from("X-API-Key"),
            value: String::from("demo"),
        });

        assert_eq!(
            request.headers.get("x-api-key").map(String::as_str),
            Some("demo")
        );
    }

    #[test]
    fn auth_debug_output_never_contains_the_secret() {
        let rendered = format!("{:?}", HttpAuth::BearerToken(String::from("s3cr3t")));
        assert!(!rendered.contains("s3cr3t"));
    }

    #[test]
    fn query_value_is_a_json_object() {
        let request = HttpRequest::get("https://example.test/")
            .with_query("start", "2024-01-01T00:00:00Z")
            .with_query("end", "2024-01-08T00:00:00Z");

        assert_eq!(
            request.query_value(),
            serde_json::json!({"start": "2024-01-01T00:00:00Z", "end": "2024-01-08T00:00:00Z"})
        );
    }

    #[test]
    fn repeated_query_names_keep_every_value_in_order() {
        let both = HttpRequest::get("https://example.test/")
            .with_query("cpcode", "a")
            .with_query("start", "2024-01-01")
            .with_query("cpcode", "b")
            .with_query("cpcode", "c");
        let last_only = HttpRequest::get("https://example.test/")
            .with_query("cpcode", "c")
            .with_query("start", "2024-01-01");

        assert_eq!(
            both.query_value(),
            serde_json::json!({"cpcode": ["a", "b", "c"], "start": "2024-01-01"})
        );
        assert_ne!(both.query_value(), last_only.query_value());
    }

    #[test]
    fn reqwest_client_applies_idle_cap_and_keeps_host_budget_informational() {
        let client = ReqwestHttpClient::new(PoolConfig {
            pool_connections: 4,
            pool_maxsize: 0,
            idle_timeout: Duration::from_secs(30),
        })
        .expect("client builds");

        let pool = client.pool_config().expect("built from a pool config");
        assert_eq!(pool.pool_maxsize, 1);
        assert_eq!(pool.pool_connections, 4);
        assert_eq!(
            ReqwestHttpClient::with_client(reqwest::Client::new()).pool_config(),
            None
        );
    }

    #[test]
    fn response_exposes_text_headers_and_json() {
        let response = HttpResponse::new(429, r#"{"data": [1, 2]}"#).with_header("Retry-After", "7");

        assert!(!response.is_success());
        assert_eq!(response.header("retry-after"), Some("7"));
        let decoded: Value = response.json().expect("valid json");
        assert_eq!(decoded["data"][1], 2);
        assert!(response.text().starts_with('{'));
    }
}
