//! Circuit-protected, optionally cached calls against one logical endpoint.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::cache::ResponseCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::FeatureToggles;
use crate::context::with_correlation_id;
use crate::error::ApiError;
use crate::executor::RequestExecutor;
use crate::http_client::{HttpMethod, HttpRequest};
use crate::validation::ResponseValidator;

/// One remote endpoint: the retrying executor behind a shared breaker, with an
/// optional response cache in front.
///
/// Cache hits never reach the breaker. Every cache miss goes through the breaker, and
/// a call rejected by an open breaker makes no network attempt.
#[derive(Debug, Clone)]
pub struct ProtectedEndpoint {
    key: String,
    executor: RequestExecutor,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<ResponseCache>>,
    validator: Option<Arc<dyn ResponseValidator>>,
}

impl ProtectedEndpoint {
    pub fn new(
        key: impl Into<String>,
        executor: RequestExecutor,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            key: key.into(),
            executor,
            breaker,
            cache: None,
            validator: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Issues `request` under this endpoint's protection.
    ///
    /// `toggles.cache` consults the cache (when one is attached); `toggles.schema_validation`
    /// runs the attached validator on fresh payloads.
    pub async fn call(
        &self,
        request: HttpRequest,
        toggles: FeatureToggles,
    ) -> Result<Value, ApiError> {
        with_correlation_id(async move {
            let validator = if toggles.schema_validation {
                self.validator.as_deref()
            } else {
                None
            };

            match self.cache.as_deref().filter(|_| toggles.cache) {
                Some(cache) => {
                    let args = cache_args(&request);
                    cache
                        .cached_call(&self.key, &args, || self.guarded(request, validator))
                        .await
                }
                None => self.guarded(request, validator).await,
            }
        })
        .await
    }

    async fn guarded(
        &self,
        request: HttpRequest,
        validator: Option<&dyn ResponseValidator>,
    ) -> Result<Value, ApiError> {
        self.breaker
            .call(|| self.executor.execute(&self.key, request, validator))
            .await
    }
}

/// Identity of a request for caching. Headers are excluded so credentials never
/// influence (or leak into) the key.
fn cache_args(request: &HttpRequest) -> Value {
    let method = match request.method {
        HttpMethod::Get => "GET",
        HttpMethod::Post => "POST",
    };
    json!({
        "method": method,
        "url": request.url,
        "query": request.query_value(),
        "body": request.body,
    })
}
