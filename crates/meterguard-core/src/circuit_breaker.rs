//! Per-endpoint circuit breaker.
//!
//! # States
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast with [`CircuitOpenError`] until the recovery timeout elapses
//! - HalfOpen: a single trial call at a time decides between Closed and Open
//!
//! ```text
//! Closed   --failure_count >= failure_threshold-->  Open
//! Open     --recovery_timeout elapsed, next call-->  HalfOpen
//! HalfOpen --success_count >= success_threshold-->  Closed
//! HalfOpen --any failure------------------------->  Open
//! ```
//!
//! The state lock is held only for transitions. The protected operation is awaited
//! outside of it, so a slow call never blocks other callers from reading the state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Runtime circuit state for an upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close the circuit again.
    pub success_threshold: u32,
    /// Cool-down measured from the last recorded failure.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Returned instead of running the operation while the circuit rejects calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker [{name}] is open, retry in {}s", .retry_in.as_secs_f64().ceil())]
pub struct CircuitOpenError {
    name: String,
    retry_in: Duration,
}

impl CircuitOpenError {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remaining cool-down. Zero while a half-open trial is already in flight.
    pub const fn retry_in(&self) -> Duration {
        self.retry_in
    }
}

/// Serializable view of a breaker, as reported by [`CircuitBreaker::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub time_until_retry_secs: f64,
    pub last_failure_secs_ago: Option<f64>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    /// Ticket of the half-open trial currently in flight.
    trial: Option<u64>,
    next_ticket: u64,
}

impl CircuitInner {
    fn admit_trial(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.trial = Some(ticket);
        ticket
    }
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            trial: None,
            next_ticket: 0,
        }
    }
}

/// Thread-safe circuit breaker guarding one logical remote endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Runs `operation` under breaker protection.
    ///
    /// Returns the operation's own result, or a [`CircuitOpenError`] (converted into
    /// `E`) without invoking `operation` when the circuit rejects the call. Any `Err`
    /// from the operation counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeeded(),
            Err(_) => permit.failed(),
        }
        result
    }

    /// Admits one call, moving an expired Open circuit to HalfOpen.
    ///
    /// The returned permit must be settled with [`CallPermit::succeeded`] or
    /// [`CallPermit::failed`]. Dropping it unsettled releases a half-open trial slot
    /// without affecting the counters.
    pub fn acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, None)),
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return Err(self.open_error(self.time_until_retry(&inner)));
                }
                tracing::info!(breaker = %self.name, "circuit breaker entering HALF_OPEN");
                inner.state = CircuitState::HalfOpen;
                inner.failure_count = 0;
                inner.success_count = 0;
                let ticket = inner.admit_trial();
                Ok(CallPermit::new(self, Some(ticket)))
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    return Err(self.open_error(Duration::ZERO));
                }
                let ticket = inner.admit_trial();
                Ok(CallPermit::new(self, Some(ticket)))
            }
        }
    }

    /// Records a success observed outside of a permit.
    ///
    /// Only the admitted trial decides a half-open circuit, so this is ignored while
    /// HalfOpen.
    pub fn record_success(&self) {
        self.settle(true, None);
    }

    /// Records a failure observed outside of a permit. Ignored while HalfOpen.
    pub fn record_failure(&self) {
        self.settle(false, None);
    }

    fn settle(&self, succeeded: bool, ticket: Option<u64>) {
        let mut inner = self.lock();
        let is_trial = ticket.is_some() && inner.trial == ticket;
        if is_trial {
            inner.trial = None;
        } else if inner.state == CircuitState::HalfOpen {
            tracing::debug!(
                breaker = %self.name,
                succeeded,
                "ignoring result of a call admitted before HALF_OPEN"
            );
            return;
        }

        if succeeded {
            self.on_success(&mut inner);
        } else {
            self.on_failure(&mut inner);
        }
    }

    fn on_success(&self, inner: &mut CircuitInner) {
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.success_count = inner.success_count.saturating_add(1);
            if inner.success_count >= self.config.success_threshold {
                tracing::info!(
                    breaker = %self.name,
                    successes = inner.success_count,
                    "circuit breaker CLOSED after recovery"
                );
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
            }
        }
    }

    fn on_failure(&self, inner: &mut CircuitInner) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "circuit breaker reopened during recovery trial");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit breaker OPEN"
                );
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            _ => {}
        }
    }

    /// Forces the circuit Closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        tracing::info!(breaker = %self.name, "circuit breaker manually reset to CLOSED");
        let next_ticket = inner.next_ticket;
        *inner = CircuitInner {
            next_ticket,
            ..CircuitInner::default()
        };
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let time_until_retry = if inner.state == CircuitState::Open {
            self.time_until_retry(&inner)
        } else {
            Duration::ZERO
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs_f64(),
            time_until_retry_secs: time_until_retry.as_secs_f64(),
            last_failure_secs_ago: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    fn release_trial(&self, ticket: u64) {
        let mut inner = self.lock();
        if inner.trial == Some(ticket) {
            inner.trial = None;
        }
    }

    fn cooldown_elapsed(&self, inner: &CircuitInner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() > self.config.recovery_timeout)
    }

    fn time_until_retry(&self, inner: &CircuitInner) -> Duration {
        inner
            .last_failure
            .map_or(Duration::ZERO, |at| {
                self.config.recovery_timeout.saturating_sub(at.elapsed())
            })
    }

    fn open_error(&self, retry_in: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket handed out by [`CircuitBreaker::acquire`].
#[derive(Debug)]
#[must_use = "a permit must be settled with succeeded() or failed()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: Option<u64>) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the half-open recovery trial.
    pub const fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.settle(true, self.trial);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.settle(false, self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let (Some(ticket), false) = (self.trial, self.settled) {
            self.breaker.release_trial(ticket);
        }
    }
}

/// One breaker per endpoint key, created lazily and shared for the owner's lifetime.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// Snapshots of every registered breaker, ordered by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots = self
            .all()
            .iter()
            .map(|breaker| breaker.snapshot())
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
