//! # Meterguard Core
//!
//! Request-resilience layer for clients of a metering HTTP API.
//!
//! ## Overview
//!
//! This crate delivers outbound API calls reliably despite transient network failures,
//! rate limiting and backend outages:
//!
//! - **Retry** with exponential backoff and full jitter, classifying every attempt
//! - **Circuit breaker** per logical endpoint, shared by every caller
//! - **Concurrent batches** over a bounded worker pool and one pooled HTTP client
//! - **Disk cache** with TTL for idempotent read-only queries
//! - **Tracing context** tying every log line of a call and its retries together
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | File-backed response cache with TTL |
//! | [`circuit_breaker`] | Circuit breaker and per-endpoint registry |
//! | [`client`] | `ResilientClient` facade |
//! | [`concurrent`] | Bounded batch executor |
//! | [`config`] | Settings, environment overrides, per-call toggles |
//! | [`context`] | Correlation ids, request and error context |
//! | [`endpoint`] | Breaker- and cache-protected endpoint |
//! | [`error`] | Terminal error taxonomy |
//! | [`executor`] | Retrying request executor |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`logging`] | Subscriber setup and secret redaction |
//! | [`retry`] | Backoff and status classification |
//! | `testing` | Scripted transport for tests (`testing` feature) |
//! | [`validation`] | Response payload validation |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meterguard_core::{CallOptions, HttpAuth, HttpRequest, ResilienceConfig, ResilientClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     meterguard_core::logging::init_logging();
//!
//!     let client = ResilientClient::new(ResilienceConfig::from_env()?)?;
//!     let request = HttpRequest::post("https://api.example.com/reporting-api/v2/reports/traffic")
//!         .with_query("start", "2024-01-01T00:00:00Z")
//!         .with_query("end", "2024-01-08T00:00:00Z")
//!         .with_auth(&HttpAuth::BearerToken(std::env::var("METERING_TOKEN")?));
//!
//!     let payload = client
//!         .call_with_resilience("traffic", request, CallOptions::default())
//!         .await?;
//!     println!("{} data points", payload["data"].as_array().map_or(0, Vec::len));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │ ResilientClient │────▶│ Concurrent Batch │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Protected       │────▶│ Response Cache   │
//! │ Endpoint        │     └──────────────────┘
//! └────────┬────────┘     ┌──────────────────┐
//!          │─────────────▶│ Circuit Breaker  │
//!          ▼              └──────────────────┘
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Request         │────▶│ HTTP Client      │
//! │ Executor        │     │ (reqwest pool)   │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Every call resolves to the decoded payload or exactly one [`ApiError`]:
//!
//! ```rust
//! use meterguard_core::{ApiError, ApiErrorKind};
//!
//! fn handle_error(error: &ApiError) {
//!     match error.kind() {
//!         ApiErrorKind::CircuitOpen => {
//!             // Upstream is known bad, come back later
//!         }
//!         ApiErrorKind::RateLimit | ApiErrorKind::Server => {
//!             // Attempt budget exhausted
//!         }
//!         ApiErrorKind::Authentication | ApiErrorKind::Authorization => {
//!             // Fix credentials, retrying will not help
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod concurrent;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod logging;
pub mod retry;
pub mod validation;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Caching
pub use cache::{CacheError, CacheStats, ResponseCache};

// Circuit breaker
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError,
    CircuitSnapshot, CircuitState,
};

// Client facade
pub use client::ResilientClient;

// Batch execution
pub use concurrent::{BatchConfig, BatchItemError, BatchResults, ConcurrentExecutor};

// Configuration
pub use config::{CallOptions, ConfigError, FeatureToggles, ResilienceConfig};

// Tracing context
pub use context::{
    current_correlation_id, generate_correlation_id, with_correlation_id,
    with_given_correlation_id, ErrorContext, RequestContext,
};

// Endpoint protection
pub use endpoint::ProtectedEndpoint;

// Error types
pub use error::{ApiError, ApiErrorKind};

// Request execution
pub use executor::{RequestExecutor, CORRELATION_HEADER};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse,
    PoolConfig, ReqwestHttpClient,
};

// Retry logic
pub use retry::{jittered_backoff, Backoff, RetryConfig, StatusClass};

// Validation
pub use validation::{DataSeriesValidator, ResponseValidator};
