//! Terminal error taxonomy for resilient API calls.

use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::circuit_breaker::CircuitOpenError;
use crate::config::ConfigError;
use crate::http_client::HttpError;

/// Error classification used for logging, batch reports and caller dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    Request,
    Authentication,
    Authorization,
    RateLimit,
    Server,
    Timeout,
    Network,
    CircuitOpen,
    Cache,
    Config,
}

/// The single terminal error a resilient call resolves to.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400, any unexpected status, or a payload that failed decoding or validation.
    #[error("HTTP {status}: {message}")]
    Request { status: u16, message: String },

    #[error("authentication failed (401): {0}")]
    Authentication(String),

    #[error("authorization failed (403): {0}")]
    Authorization(String),

    /// 429 after the attempt budget was spent.
    #[error(
        "rate limit exceeded{}",
        .retry_after.map(|secs| format!(", retry after {secs} seconds")).unwrap_or_default()
    )]
    RateLimit { retry_after: Option<u64> },

    /// 5xx after the attempt budget was spent.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: HttpError,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ApiError {
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        Self::Request {
            status,
            message: message.into(),
        }
    }

    pub fn network(source: HttpError) -> Self {
        Self::Network {
            message: source.message().to_owned(),
            source,
        }
    }

    pub const fn kind(&self) -> ApiErrorKind {
        match self {
            Self::Request { .. } => ApiErrorKind::Request,
            Self::Authentication(_) => ApiErrorKind::Authentication,
            Self::Authorization(_) => ApiErrorKind::Authorization,
            Self::RateLimit { .. } => ApiErrorKind::RateLimit,
            Self::Server { .. } => ApiErrorKind::Server,
            Self::Timeout { .. } => ApiErrorKind::Timeout,
            Self::Network { .. } => ApiErrorKind::Network,
            Self::CircuitOpen(_) => ApiErrorKind::CircuitOpen,
            Self::Cache(_) => ApiErrorKind::Cache,
            Self::Config(_) => ApiErrorKind::Config,
        }
    }

    /// HTTP status behind the error, when there was a response.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } | Self::Server { status } => Some(*status),
            Self::Authentication(_) => Some(401),
            Self::Authorization(_) => Some(403),
            Self::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the same call may succeed if tried again later.
    pub const fn retryable(&self) -> bool {
        matches!(
            self.kind(),
            ApiErrorKind::RateLimit
                | ApiErrorKind::Server
                | ApiErrorKind::Timeout
                | ApiErrorKind::Network
                | ApiErrorKind::CircuitOpen
        )
    }

    pub const fn code(&self) -> &'static str {
        match self.kind() {
            ApiErrorKind::Request => "api.request",
            ApiErrorKind::Authentication => "api.authentication",
            ApiErrorKind::Authorization => "api.authorization",
            ApiErrorKind::RateLimit => "api.rate_limit",
            ApiErrorKind::Server => "api.server",
            ApiErrorKind::Timeout => "api.timeout",
            ApiErrorKind::Network => "api.network",
            ApiErrorKind::CircuitOpen => "api.circuit_open",
            ApiErrorKind::Cache => "api.cache",
            ApiErrorKind::Config => "api.config",
        }
    }
}
