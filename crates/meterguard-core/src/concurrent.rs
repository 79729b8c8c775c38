//! Bounded fan-out of independent per-item calls.
//!
//! Items are submitted one by one with a small stagger and run on spawned tasks, at
//! most `max_workers` at a time. Every submitted item yields exactly one entry in the
//! [`BatchResults`], in submission order; a batch never fails as a whole.

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;

use crate::context::{generate_correlation_id, with_given_correlation_id};
use crate::error::ApiError;

/// Worker-pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_workers: usize,
    /// Delay between two submissions.
    pub rate_limit_delay: Duration,
    /// Budget for one item once a worker has picked it up.
    pub item_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            rate_limit_delay: Duration::from_millis(100),
            item_timeout: Duration::from_secs(120),
        }
    }
}

/// Why a single batch item has no result.
#[derive(Debug, Error)]
pub enum BatchItemError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("item timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("item was cancelled by executor shutdown")]
    Cancelled,

    #[error("executor is shut down")]
    Shutdown,
}

impl BatchItemError {
    /// Inline failure record, as stored in place of a result.
    pub fn to_record(&self) -> Value {
        let code = match self {
            Self::Api(error) => error.code(),
            Self::TimedOut(_) => "batch.timeout",
            Self::Panicked(_) => "batch.panicked",
            Self::Cancelled => "batch.cancelled",
            Self::Shutdown => "batch.shutdown",
        };
        json!({"success": false, "code": code, "error": self.to_string()})
    }
}

/// Per-item outcomes of one batch, in submission order.
#[derive(Debug)]
pub struct BatchResults<K, T> {
    entries: Vec<(K, Result<T, BatchItemError>)>,
}

impl<K, T> BatchResults<K, T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|(_, result)| result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Result<T, BatchItemError>)> {
        self.entries.iter().map(|(item, result)| (item, result))
    }

    pub fn get(&self, item: &K) -> Option<&Result<T, BatchItemError>>
    where
        K: PartialEq,
    {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == item)
            .map(|(_, result)| result)
    }

    pub fn into_vec(self) -> Vec<(K, Result<T, BatchItemError>)> {
        self.entries
    }
}

impl<K, T> IntoIterator for BatchResults<K, T> {
    type Item = (K, Result<T, BatchItemError>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Bounded worker pool for batch calls.
///
/// Shutting down (explicitly or by dropping the executor) aborts in-flight items and
/// makes every later batch report [`BatchItemError::Shutdown`] for each item.
#[derive(Debug)]
pub struct ConcurrentExecutor {
    config: BatchConfig,
    workers: Arc<Semaphore>,
    in_flight: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
}

impl ConcurrentExecutor {
    pub fn new(config: BatchConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            config: BatchConfig {
                max_workers,
                ..config
            },
            workers: Arc::new(Semaphore::new(max_workers)),
            in_flight: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub const fn config(&self) -> BatchConfig {
        self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Runs `call(item, shared.clone())` for every item.
    ///
    /// Each item runs in its own task under a fresh correlation id. Failures, timeouts
    /// and panics are recorded inline for that item only.
    pub async fn execute_batch<K, S, T, F, Fut>(
        &self,
        items: impl IntoIterator<Item = K>,
        shared: S,
        call: F,
    ) -> BatchResults<K, T>
    where
        K: Clone + Debug + Send + 'static,
        S: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(K, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let items = items.into_iter().collect::<Vec<_>>();
        if items.is_empty() {
            return BatchResults {
                entries: Vec::new(),
            };
        }
        if self.is_shut_down() {
            tracing::warn!(items = items.len(), "batch submitted after shutdown");
            return BatchResults {
                entries: items
                    .into_iter()
                    .map(|item| (item, Err(BatchItemError::Shutdown)))
                    .collect(),
            };
        }

        tracing::info!(
            items = items.len(),
            max_workers = self.config.max_workers,
            "starting concurrent batch"
        );

        let call = Arc::new(call);
        let total = items.len();
        let mut handles = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 && !self.config.rate_limit_delay.is_zero() {
                tokio::time::sleep(self.config.rate_limit_delay).await;
            }
            let handle = self.submit(item.clone(), shared.clone(), Arc::clone(&call));
            handles.push((item, handle));
        }

        let mut entries = Vec::with_capacity(total);
        for (item, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(error) => Err(join_failure(error)),
            };
            match &result {
                Ok(_) => tracing::debug!(item = ?item, "batch item completed"),
                Err(error) => tracing::error!(item = ?item, error = %error, "batch item failed"),
            }
            entries.push((item, result));
        }
        self.forget_finished();

        let results = BatchResults { entries };
        tracing::info!(
            "concurrent batch completed: {} success, {} failed",
            results.succeeded(),
            results.failed()
        );
        results
    }

    fn submit<K, S, T, F, Fut>(
        &self,
        item: K,
        shared: S,
        call: Arc<F>,
    ) -> JoinHandle<Result<T, BatchItemError>>
    where
        K: Debug + Send + 'static,
        S: Send + 'static,
        T: Send + 'static,
        F: Fn(K, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        let item_timeout = self.config.item_timeout;
        let correlation_id = generate_correlation_id();
        let span = tracing::info_span!("batch_item", item = ?item, correlation_id = %correlation_id);

        let handle = tokio::spawn(
            async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return Err(BatchItemError::Shutdown);
                };
                let run = with_given_correlation_id(correlation_id, call(item, shared));
                match tokio::time::timeout(item_timeout, run).await {
                    Ok(result) => result.map_err(BatchItemError::from),
                    Err(_) => Err(BatchItemError::TimedOut(item_timeout)),
                }
            }
            .instrument(span),
        );

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.abort_handle());
        handle
    }

    fn forget_finished(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|handle| !handle.is_finished());
    }

    /// Stops accepting work and aborts in-flight items. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.workers.close();
        let aborted = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = in_flight.iter().filter(|handle| !handle.is_finished()).count();
            for handle in in_flight.drain(..) {
                handle.abort();
            }
            pending
        };
        tracing::info!(aborted, "concurrent executor shut down");
    }
}

impl Drop for ConcurrentExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_failure(error: JoinError) -> BatchItemError {
    if error.is_cancelled() {
        return BatchItemError::Cancelled;
    }
    BatchItemError::Panicked(panic_message(error.into_panic()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map_or_else(|| String::from("unknown panic"), |message| (*message).to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::context::current_correlation_id;

    fn config(max_workers: usize) -> BatchConfig {
        BatchConfig {
            max_workers,
            rate_limit_delay: Duration::from_millis(100),
            item_timeout: Duration::from_secs(120),
        }
    }

    async fn slow_double(item: u32, latency: Duration) -> Result<u32, ApiError> {
        tokio::time::sleep(latency).await;
        if item == 3 {
            return Err(ApiError::Server { status: 503 });
        }
        Ok(item * 2)
    }

    #[tokio::test(start_paused = true)]
    async fn batch_runs_in_parallel_and_isolates_failures() {
        let executor = ConcurrentExecutor::new(config(3));
        let started = tokio::time::Instant::now();

        let results = executor
            .execute_batch(1..=6, Duration::from_secs(1), slow_double)
            .await;

        assert_eq!(results.len(), 6);
        assert_eq!(results.succeeded(), 5);
        assert_eq!(results.failed(), 1);
        assert!(matches!(results.get(&1), Some(Ok(2))));
        assert!(matches!(
            results.get(&3),
            Some(Err(BatchItemError::Api(ApiError::Server { status: 503 })))
        ));
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        let order = results.iter().map(|(item, _)| *item).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_max_workers() {
        let executor = ConcurrentExecutor::new(config(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = executor
            .execute_batch(0..8_u32, (active, Arc::clone(&peak)), |item, (active, peak)| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ApiError>(item)
            })
            .await;

        assert_eq!(results.succeeded(), 8);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_item_times_out_without_affecting_others() {
        let executor = ConcurrentExecutor::new(BatchConfig {
            item_timeout: Duration::from_secs(5),
            ..config(3)
        });

        let results = executor
            .execute_batch([1_u32, 2], (), |item, ()| async move {
                let latency = if item == 2 { 60 } else { 1 };
                tokio::time::sleep(Duration::from_secs(latency)).await;
                Ok::<_, ApiError>(item)
            })
            .await;

        assert!(matches!(results.get(&1), Some(Ok(1))));
        assert!(matches!(results.get(&2), Some(Err(BatchItemError::TimedOut(_)))));
    }

    #[tokio::test]
    async fn panicking_item_is_reported_inline() {
        let executor = ConcurrentExecutor::new(config(2));

        let results = executor
            .execute_batch(["ok", "boom"], (), |item, ()| async move {
                if item == "boom" {
                    panic!("parser exploded");
                }
                Ok::<_, ApiError>(item.len())
            })
            .await;

        assert!(matches!(results.get(&"ok"), Some(Ok(2))));
        match results.get(&"boom") {
            Some(Err(BatchItemError::Panicked(message))) => assert_eq!(message, "parser exploded"),
            other => panic!("expected panic record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn each_item_gets_its_own_correlation_id() {
        let executor = ConcurrentExecutor::new(config(3));

        let results = executor
            .execute_batch(0..3_u32, (), |_, ()| async move {
                Ok::<_, ApiError>(current_correlation_id())
            })
            .await;

        let mut ids = results
            .into_iter()
            .map(|(_, result)| result.expect("ok").expect("id set"))
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fails_later_batches() {
        let executor = ConcurrentExecutor::new(config(3));
        executor.shutdown();
        executor.shutdown();
        assert!(executor.is_shut_down());

        let results = executor
            .execute_batch(["a", "b"], (), |item, ()| async move { Ok::<_, ApiError>(item) })
            .await;

        assert_eq!(results.failed(), 2);
        for (_, result) in results.iter() {
            let error = result.as_ref().expect_err("shut down");
            assert!(matches!(error, BatchItemError::Shutdown));
            assert_eq!(error.to_record()["code"], "batch.shutdown");
        }
    }

    #[tokio::test]
    async fn empty_batch_returns_empty_results() {
        let executor = ConcurrentExecutor::new(config(3));
        let results = executor
            .execute_batch(Vec::<u32>::new(), (), |item, ()| async move { Ok::<_, ApiError>(item) })
            .await;
        assert!(results.is_empty());
    }
}
