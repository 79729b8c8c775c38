//! Correlation ids, request context and error context.
//!
//! A correlation id lives in task-local storage for the duration of one logical call,
//! including every retry attempt, so all log lines produced while servicing it can be
//! joined. The [`RequestContext`] of the active call is kept next to it and captured
//! into an [`ErrorContext`] whenever an error is observed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::logging::sanitize;

tokio::task_local! {
    static CORRELATION_ID: String;
    static REQUEST_CONTEXT: RefCell<Option<RequestContext>>;
}

pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Correlation id of the current task, if one is active.
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

/// Runs `future` with a correlation id, generating one unless the task already has one.
pub async fn with_correlation_id<F: Future>(future: F) -> F::Output {
    if current_correlation_id().is_some() {
        future.await
    } else {
        CORRELATION_ID.scope(generate_correlation_id(), future).await
    }
}

/// Runs `future` under an explicit correlation id, replacing any active one.
pub async fn with_given_correlation_id<F: Future>(id: impl Into<String>, future: F) -> F::Output {
    CORRELATION_ID.scope(id.into(), future).await
}

/// Attaches `context` to the current task for the duration of `future`.
pub async fn with_request_context<F: Future>(context: RequestContext, future: F) -> F::Output {
    REQUEST_CONTEXT.scope(RefCell::new(Some(context)), future).await
}

/// Snapshot of the request context attached to the current task.
pub fn current_request_context() -> Option<RequestContext> {
    REQUEST_CONTEXT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Mutates the active request context in place. Returns false when none is attached.
pub fn update_request_context(update: impl FnOnce(&mut RequestContext)) -> bool {
    REQUEST_CONTEXT
        .try_with(|slot| match slot.borrow_mut().as_mut() {
            Some(context) => {
                update(context);
                true
            }
            None => false,
        })
        .unwrap_or(false)
}

/// Context of one outbound call chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    pub correlation_id: String,
    pub endpoint: String,
    pub params: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub attempt: u32,
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip)]
    started: Instant,
}

impl RequestContext {
    /// New context bound to the active correlation id, or a fresh one.
    pub fn new(endpoint: impl Into<String>, params: Value) -> Self {
        Self {
            correlation_id: current_correlation_id().unwrap_or_else(generate_correlation_id),
            endpoint: endpoint.into(),
            params,
            start_time: OffsetDateTime::now_utc(),
            attempt: 0,
            metadata: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Immutable record of an error, enriched with the active tracing context.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    error_kind: String,
    error_message: String,
    stack_trace: Vec<String>,
    correlation_id: Option<String>,
    request_context: Option<RequestContext>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    additional_context: BTreeMap<String, Value>,
}

impl ErrorContext {
    /// Captures `error` together with the current correlation id and request context.
    ///
    /// The trace holds the error's source chain followed by the backtrace, which is
    /// only populated when `RUST_BACKTRACE` enables capture.
    pub fn capture(
        error_kind: impl Into<String>,
        error: &(dyn StdError + 'static),
        additional_context: BTreeMap<String, Value>,
    ) -> Self {
        let mut stack_trace = Vec::new();
        let mut cause = error.source();
        while let Some(source) = cause {
            stack_trace.push(format!("caused by: {}", sanitize(&source.to_string())));
            cause = source.source();
        }
        let backtrace = std::backtrace::Backtrace::capture();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            stack_trace.extend(backtrace.to_string().lines().map(str::to_owned));
        }

        let request_context = current_request_context();
        let correlation_id = request_context
            .as_ref()
            .map(|context| context.correlation_id.clone())
            .or_else(current_correlation_id);

        Self {
            error_kind: error_kind.into(),
            error_message: sanitize(&error.to_string()).into_owned(),
            stack_trace,
            correlation_id,
            request_context,
            timestamp: OffsetDateTime::now_utc(),
            additional_context,
        }
    }

    pub fn error_kind(&self) -> &str {
        &self.error_kind
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn request_context(&self) -> Option<&RequestContext> {
        self.request_context.as_ref()
    }

    pub const fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn additional_context(&self) -> &BTreeMap<String, Value> {
        &self.additional_context
    }

    /// Single-line JSON rendering for structured log fields.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.error_message.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http_client::HttpError;
    use crate::ApiError;

    #[tokio::test]
    async fn correlation_id_is_generated_once_and_reused_by_nested_scopes() {
        assert_eq!(current_correlation_id(), None);

        let (outer, inner) = with_correlation_id(async {
            let outer = current_correlation_id();
            let inner = with_correlation_id(async { current_correlation_id() }).await;
            (outer, inner)
        })
        .await;

        let outer = outer.expect("scope provides an id");
        assert_eq!(outer.len(), 36);
        assert_eq!(Some(outer), inner);
        assert_eq!(current_correlation_id(), None);
    }

    #[tokio::test]
    async fn explicit_correlation_id_is_honored() {
        let seen = with_given_correlation_id("req-42", async {
            with_correlation_id(async { current_correlation_id() }).await
        })
        .await;
        assert_eq!(seen.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn request_context_tracks_attempts_and_elapsed_time() {
        with_given_correlation_id("req-7", async {
            let context = RequestContext::new("traffic", json!({"start": "2024-01-01"}))
                .with_metadata("api_type", "traffic");
            assert_eq!(context.correlation_id, "req-7");

            with_request_context(context, async {
                assert!(update_request_context(|ctx| ctx.attempt = 2));
                tokio::time::sleep(Duration::from_millis(5)).await;
                let snapshot = current_request_context().expect("context attached");
                assert_eq!(snapshot.attempt, 2);
                assert!(snapshot.elapsed() >= Duration::from_millis(5));
            })
            .await;
        })
        .await;

        assert!(!update_request_context(|ctx| ctx.attempt = 9));
    }

    #[tokio::test]
    async fn error_context_copies_active_correlation_and_request_snapshot() {
        let error = ApiError::network(HttpError::connect("connection refused"));
        let captured = with_given_correlation_id("req-9", async {
            let context = RequestContext::new("emissions", json!({"end": "2024-02-01"}));
            with_request_context(context, async {
                update_request_context(|ctx| ctx.attempt = 3);
                ErrorContext::capture(
                    "network",
                    &error,
                    BTreeMap::from([(String::from("url"), json!("https://example.test"))]),
                )
            })
            .await
        })
        .await;

        assert_eq!(captured.correlation_id(), Some("req-9"));
        assert_eq!(captured.error_kind(), "network");
        assert_eq!(captured.error_message(), "network error: connection refused");
        assert_eq!(captured.stack_trace()[0], "caused by: connection refused");
        let request = captured.request_context().expect("snapshot captured");
        assert_eq!(request.attempt, 3);
        assert_eq!(request.params, json!({"end": "2024-02-01"}));

        let rendered: Value = serde_json::from_str(&captured.to_json()).expect("valid json");
        assert_eq!(rendered["request_context"]["endpoint"], "emissions");
        assert_eq!(rendered["additional_context"]["url"], "https://example.test");
    }

    #[test]
    fn error_context_without_active_call_has_no_correlation() {
        let error = HttpError::timeout("deadline elapsed");
        let captured = ErrorContext::capture("timeout", &error, BTreeMap::new());
        assert_eq!(captured.correlation_id(), None);
        assert!(captured.request_context().is_none());
    }
}
