//! Entry point tying configuration, transport, breakers, cache and validators together.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde_json::Value;

use crate::cache::{CacheError, CacheStats, ResponseCache};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::concurrent::{BatchResults, ConcurrentExecutor};
use crate::config::{CallOptions, FeatureToggles, ResilienceConfig};
use crate::context::with_given_correlation_id;
use crate::endpoint::ProtectedEndpoint;
use crate::error::ApiError;
use crate::executor::RequestExecutor;
use crate::http_client::{HttpClient, HttpRequest, ReqwestHttpClient};
use crate::validation::ResponseValidator;

struct ClientInner {
    config: ResilienceConfig,
    http: Arc<dyn HttpClient>,
    breakers: CircuitBreakerRegistry,
    cache: OnceLock<Arc<ResponseCache>>,
    validators: RwLock<HashMap<String, Arc<dyn ResponseValidator>>>,
}

/// Resilient API client.
///
/// Cloning is cheap; clones share the connection pool, the breaker per endpoint and
/// the response cache. The cache directory is only created on first cached call.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<ClientInner>,
}

impl Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.inner.config)
            .field("breakers", &self.inner.breakers)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Client over a pooled reqwest transport sized by `config`.
    pub fn new(config: ResilienceConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let http = ReqwestHttpClient::new(config.pool_config()).map_err(ApiError::network)?;
        Self::with_http_client(config, Arc::new(http))
    }

    /// Client over a caller-supplied transport.
    pub fn with_http_client(
        config: ResilienceConfig,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, ApiError> {
        config.validate()?;
        tracing::info!(
            max_retries = config.max_retries,
            failure_threshold = config.failure_threshold,
            max_workers = config.max_workers,
            cache_dir = %config.cache_dir.display(),
            "resilient client configured"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                breakers: CircuitBreakerRegistry::new(config.breaker_config()),
                config,
                http,
                cache: OnceLock::new(),
                validators: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    /// Attaches `validator` to every later call against `endpoint`.
    pub fn register_validator(
        &self,
        endpoint: impl Into<String>,
        validator: Arc<dyn ResponseValidator>,
    ) {
        self.inner
            .validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), validator);
    }

    /// Uncached protected endpoint sharing this client's breaker for `key`.
    pub fn endpoint(&self, key: &str) -> ProtectedEndpoint {
        let config = &self.inner.config;
        let executor = RequestExecutor::new(Arc::clone(&self.inner.http), config.retry_config())
            .with_data_point_limit(config.data_point_limit, config.data_point_warning_threshold());
        let endpoint = ProtectedEndpoint::new(key, executor, self.inner.breakers.get_or_create(key));

        let validator = self
            .inner
            .validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        match validator {
            Some(validator) => endpoint.with_validator(validator),
            None => endpoint,
        }
    }

    /// Protected endpoint with the response cache in front.
    pub fn cached_endpoint(&self, key: &str) -> Result<ProtectedEndpoint, ApiError> {
        Ok(self.endpoint(key).with_cache(self.cache()?))
    }

    /// Issues `request` against `endpoint` with retries, breaker protection and the
    /// optional cache and schema validation.
    ///
    /// The cache and validation toggles come from `ENABLE_API_CACHE` and
    /// `ENABLE_SCHEMA_VALIDATION` unless `options` overrides them. The request timeout
    /// is `options.timeout`, else the endpoint's configured timeout.
    pub async fn call_with_resilience(
        &self,
        endpoint: &str,
        request: HttpRequest,
        options: CallOptions,
    ) -> Result<Value, ApiError> {
        let toggles = options.resolve(FeatureToggles::from_env());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.timeout_for(endpoint));
        let request = request.with_timeout(timeout);

        let protected = if toggles.cache {
            self.cached_endpoint(endpoint)?
        } else {
            self.endpoint(endpoint)
        };

        match options.correlation_id {
            Some(id) => with_given_correlation_id(id, protected.call(request, toggles)).await,
            None => protected.call(request, toggles).await,
        }
    }

    /// Runs `call(item, client)` for every item on a worker pool sized by the config.
    ///
    /// The pool lives for this batch only and is shut down before returning.
    pub async fn execute_batch<K, T, F, Fut>(
        &self,
        items: impl IntoIterator<Item = K>,
        call: F,
    ) -> BatchResults<K, T>
    where
        K: Clone + Debug + Send + 'static,
        T: Send + 'static,
        F: Fn(K, ResilientClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let executor = self.batch_executor();
        let results = executor.execute_batch(items, self.clone(), call).await;
        executor.shutdown();
        results
    }

    pub fn batch_executor(&self) -> ConcurrentExecutor {
        ConcurrentExecutor::new(self.inner.config.batch_config())
    }

    pub fn breaker_states(&self) -> Vec<CircuitSnapshot> {
        self.inner.breakers.snapshots()
    }

    pub fn reset_breakers(&self) {
        self.inner.breakers.reset_all();
        tracing::info!("all circuit breakers reset");
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, ApiError> {
        Ok(self.cache()?.stats().await?)
    }

    /// Deletes every cached response. Returns the number removed.
    pub async fn clear_cache(&self) -> Result<usize, ApiError> {
        Ok(self.cache()?.clear().await?)
    }

    pub async fn purge_expired_cache(&self) -> Result<usize, ApiError> {
        Ok(self.cache()?.purge_expired().await?)
    }

    fn cache(&self) -> Result<Arc<ResponseCache>, CacheError> {
        if let Some(cache) = self.inner.cache.get() {
            return Ok(Arc::clone(cache));
        }
        let config = &self.inner.config;
        let cache = Arc::new(ResponseCache::new(&config.cache_dir, config.cache_ttl)?);
        Ok(Arc::clone(self.inner.cache.get_or_init(|| cache)))
    }
}
