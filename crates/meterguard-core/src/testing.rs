//! Scripted transport for tests, enabled by the `testing` feature.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};

pub type Outcome = Result<HttpResponse, HttpError>;

/// Replays scripted outcomes in order, then repeats a fallback, recording every request.
///
/// With no fallback, attempts past the end of the script fail with an
/// [`HttpError`] of kind `Other`.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Option<Outcome>,
    latency: Duration,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedClient {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn always(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(outcome),
            ..Self::default()
        })
    }

    /// Script first, then `fallback` forever.
    pub fn with_fallback(script: impl IntoIterator<Item = Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Some(fallback),
            ..Self::default()
        })
    }

    /// Every response is delayed by `latency` (virtual time under a paused clock).
    pub fn slow(outcome: Outcome, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(outcome),
            latency,
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl HttpClient for ScriptedClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(HttpError::other("scripted client ran out of responses")));
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            next
        })
    }
}
