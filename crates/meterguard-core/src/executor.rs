//! Retrying request executor.
//!
//! One [`RequestExecutor::execute`] call is one logical request: it issues up to
//! `max_retries` HTTP attempts, classifies each outcome and either returns the decoded
//! payload or a single terminal [`ApiError`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::Instrument;

use crate::context::{
    current_correlation_id, update_request_context, with_correlation_id, with_request_context,
    ErrorContext, RequestContext,
};
use crate::error::ApiError;
use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::logging::truncate_for_log;
use crate::retry::{RetryConfig, StatusClass};
use crate::validation::{data_point_count, ResponseValidator};

/// Header carrying the correlation id on every attempt.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_LOGGED_BODY_CHARS: usize = 1_000;

/// Outcome of one attempt that did not fail the call.
enum Step {
    Done(Value),
    RetryAfter(Duration),
}

#[derive(Clone)]
pub struct RequestExecutor {
    http: Arc<dyn HttpClient>,
    retry: RetryConfig,
    data_point_limit: usize,
    data_point_warning_threshold: usize,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("retry", &self.retry)
            .field("data_point_limit", &self.data_point_limit)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    pub fn new(http: Arc<dyn HttpClient>, retry: RetryConfig) -> Self {
        Self {
            http,
            retry,
            data_point_limit: usize::MAX,
            data_point_warning_threshold: usize::MAX,
        }
    }

    /// Logs a warning when a payload's `data` array reaches `warning_threshold`.
    pub fn with_data_point_limit(mut self, limit: usize, warning_threshold: usize) -> Self {
        self.data_point_limit = limit;
        self.data_point_warning_threshold = warning_threshold;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Runs `request` with retries and returns the decoded JSON payload.
    ///
    /// A correlation id is generated unless the task already carries one; it is kept
    /// for every attempt and sent as [`CORRELATION_HEADER`]. `validator`, when given,
    /// must accept the payload or the call fails with a 422 request error.
    pub async fn execute(
        &self,
        endpoint: &str,
        request: HttpRequest,
        validator: Option<&dyn ResponseValidator>,
    ) -> Result<Value, ApiError> {
        with_correlation_id(async {
            let context = RequestContext::new(endpoint, request.query_value())
                .with_metadata("url", request.url.clone())
                .with_metadata("max_attempts", self.retry.max_retries);
            let span = tracing::info_span!(
                "api_call",
                endpoint,
                correlation_id = %context.correlation_id
            );
            with_request_context(context, self.run(request, validator))
                .instrument(span)
                .await
        })
        .await
    }

    async fn run(
        &self,
        mut request: HttpRequest,
        validator: Option<&dyn ResponseValidator>,
    ) -> Result<Value, ApiError> {
        if let Some(id) = current_correlation_id() {
            request = request.with_header(CORRELATION_HEADER, id);
        }
        let max_attempts = self.retry.max_retries.max(1);
        let started = tokio::time::Instant::now();

        let mut attempt = 0;
        loop {
            update_request_context(|context| context.attempt = attempt + 1);
            tracing::info!(attempt = attempt + 1, max_attempts, "sending request");

            let outcome = match self.http.execute(request.clone()).await {
                Ok(response) => {
                    tracing::info!(
                        status = response.status,
                        elapsed_ms = elapsed_ms(started),
                        "response received"
                    );
                    self.on_response(attempt, response, validator)?
                }
                Err(error) => self.on_transport_error(attempt, &request, started, error)?,
            };

            match outcome {
                Step::Done(payload) => return Ok(payload),
                Step::RetryAfter(delay) if !delay.is_zero() => tokio::time::sleep(delay).await,
                Step::RetryAfter(_) => {}
            }
            attempt += 1;
        }
    }

    fn on_response(
        &self,
        attempt: u32,
        response: HttpResponse,
        validator: Option<&dyn ResponseValidator>,
    ) -> Result<Step, ApiError> {
        let status = response.status;
        match StatusClass::of(status) {
            StatusClass::Success => self.accept(response, validator).map(Step::Done),
            StatusClass::BadRequest => {
                let body = truncate_for_log(response.text(), MAX_LOGGED_BODY_CHARS);
                tracing::error!(status, body = %body, "request rejected");
                Err(ApiError::request(status, body))
            }
            StatusClass::Unauthorized => {
                tracing::error!(status, "authentication failed");
                Err(ApiError::Authentication(String::from(
                    "authentication failed (401)",
                )))
            }
            StatusClass::Forbidden => {
                tracing::error!(status, "authorization failed");
                Err(ApiError::Authorization(String::from(
                    "authorization failed (403)",
                )))
            }
            StatusClass::RateLimited => {
                if !self.retry.has_attempts_left(attempt) {
                    let retry_after = response
                        .header("retry-after")
                        .and_then(|value| value.trim().parse::<u64>().ok());
                    tracing::error!(attempts = attempt + 1, ?retry_after, "rate limit exceeded");
                    return Err(ApiError::RateLimit { retry_after });
                }
                let delay = self.retry.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay_ms(delay),
                    "rate limited, backing off"
                );
                Ok(Step::RetryAfter(delay))
            }
            StatusClass::ServerError => {
                if !self.retry.has_attempts_left(attempt) {
                    tracing::error!(status, attempts = attempt + 1, "server error, giving up");
                    return Err(ApiError::Server { status });
                }
                let delay = self.retry.delay_for_attempt(attempt);
                tracing::warn!(
                    status,
                    attempt = attempt + 1,
                    delay_ms = delay_ms(delay),
                    "server error, backing off"
                );
                Ok(Step::RetryAfter(delay))
            }
            StatusClass::Unexpected => {
                tracing::error!(status, "unexpected status code");
                Err(ApiError::request(
                    status,
                    format!("unexpected status code: {status}"),
                ))
            }
        }
    }

    fn on_transport_error(
        &self,
        attempt: u32,
        request: &HttpRequest,
        started: tokio::time::Instant,
        error: HttpError,
    ) -> Result<Step, ApiError> {
        let kind = if error.is_timeout() { "timeout" } else { "network" };
        let context = ErrorContext::capture(
            kind,
            &error,
            BTreeMap::from([
                (String::from("attempt"), json!(attempt + 1)),
                (String::from("url"), json!(request.url)),
                (String::from("duration_ms"), json!(elapsed_ms(started))),
            ]),
        );
        tracing::debug!(error_context = %context.to_json(), "transport error captured");

        let exhausted = !self.retry.has_attempts_left(attempt);
        if error.is_timeout() {
            if exhausted {
                tracing::error!(attempts = attempt + 1, "request timed out, giving up");
                return Err(ApiError::Timeout {
                    attempts: attempt + 1,
                });
            }
            tracing::warn!(attempt = attempt + 1, "request timed out, retrying");
            return Ok(Step::RetryAfter(self.retry.timeout_backoff.delay(attempt)));
        }

        if exhausted {
            tracing::error!(attempts = attempt + 1, error = %context.error_message(), "network error, giving up");
            return Err(ApiError::network(error));
        }
        let delay = self.retry.network_backoff.delay(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            delay_ms = delay_ms(delay),
            error = %context.error_message(),
            "network error, retrying"
        );
        Ok(Step::RetryAfter(delay))
    }

    /// Decodes, size-checks and optionally validates a 2xx payload.
    fn accept(
        &self,
        response: HttpResponse,
        validator: Option<&dyn ResponseValidator>,
    ) -> Result<Value, ApiError> {
        let status = response.status;
        let payload: Value = response.json().map_err(|e| {
            tracing::error!(status, error = %e, "response body is not valid JSON");
            ApiError::request(status, format!("invalid JSON in response body: {e}"))
        })?;

        let points = data_point_count(&payload);
        tracing::info!(data_points = points, "request succeeded");
        if points >= self.data_point_warning_threshold {
            tracing::warn!(
                data_points = points,
                limit = self.data_point_limit,
                "approaching data point limit"
            );
        }

        if let Some(validator) = validator {
            validator.validate(&payload).map_err(|reason| {
                tracing::error!(reason = %reason, "schema validation failed");
                ApiError::request(422, format!("schema validation failed: {reason}"))
            })?;
            tracing::debug!("schema validation passed");
        }
        Ok(payload)
    }
}

fn elapsed_ms(started: tokio::time::Instant) -> u64 {
    delay_ms(started.elapsed())
}

fn delay_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
