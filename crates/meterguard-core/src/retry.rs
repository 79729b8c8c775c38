//! Retry policy: status classification and exponential backoff with full jitter.

use std::time::Duration;

/// Upper bound for a single computed delay when no cap is configured.
const MAX_UNCAPPED_DELAY_SECS: f64 = 86_400.0;

/// Backoff strategy applied before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Full-jitter exponential backoff.
    ///
    /// The delay is sampled uniformly from `[0, min(base ^ attempt, cap)]` seconds, so
    /// concurrent callers failing together spread their retries out instead of
    /// retrying in lockstep.
    Exponential {
        /// Exponential base, in seconds.
        base: f64,
        /// Optional ceiling for the sampling window.
        cap: Option<Duration>,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: 2.0,
            cap: Some(Duration::from_secs(60)),
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry attempt (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => delay,
            Self::Exponential { base, cap } => jittered_backoff(attempt, base, cap),
        }
    }

    /// Largest delay [`Backoff::delay`] can return for `attempt`.
    pub fn ceiling(self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => delay,
            Self::Exponential { base, cap } => Duration::from_secs_f64(window_secs(attempt, base, cap)),
        }
    }
}

/// Samples a delay uniformly from `[0, min(base ^ attempt, cap)]` seconds.
pub fn jittered_backoff(attempt: u32, base: f64, cap: Option<Duration>) -> Duration {
    let upper = window_secs(attempt, base, cap);
    Duration::from_secs_f64(fastrand::f64() * upper)
}

fn window_secs(attempt: u32, base: f64, cap: Option<Duration>) -> f64 {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let mut upper = base.powi(exponent);
    if let Some(cap) = cap {
        upper = upper.min(cap.as_secs_f64());
    }
    if upper.is_finite() {
        upper.clamp(0.0, MAX_UNCAPPED_DELAY_SECS)
    } else {
        MAX_UNCAPPED_DELAY_SECS
    }
}

/// How a single HTTP status participates in the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    BadRequest,
    Unauthorized,
    Forbidden,
    RateLimited,
    ServerError,
    Unexpected,
}

impl StatusClass {
    pub const fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Unexpected,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError)
    }
}

/// Configuration for the request retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempt budget, including the first attempt.
    pub max_retries: u32,
    /// Backoff used after 429 and 5xx responses.
    pub backoff: Backoff,
    /// Backoff used after timeouts.
    pub timeout_backoff: Backoff,
    /// Backoff used after connection-level transport failures.
    pub network_backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            timeout_backoff: Backoff::None,
            network_backoff: Backoff::Fixed {
                delay: Duration::from_secs(1),
            },
        }
    }
}

impl RetryConfig {
    /// Retry configuration with full-jitter exponential backoff.
    pub fn exponential(max_retries: u32, base: f64, cap: Option<Duration>) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, cap },
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn with_network_delay(mut self, delay: Duration) -> Self {
        self.network_backoff = Backoff::Fixed { delay };
        self
    }

    /// Whether another attempt is allowed after the 0-based `attempt` failed.
    pub const fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_retries
    }

    /// Calculate the delay after a retryable status on the given attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_window() {
        for (attempt, base, cap, upper) in [
            (0, 2.0, None, 1.0),
            (1, 2.0, None, 2.0),
            (2, 2.0, None, 4.0),
            (2, 3.0, None, 9.0),
            (10, 2.0, Some(Duration::from_secs(5)), 5.0),
        ] {
            for _ in 0..100 {
                let delay = jittered_backoff(attempt, base, cap).as_secs_f64();
                assert!(
                    (0.0..=upper).contains(&delay),
                    "attempt={attempt}, base={base}, delay={delay}, upper={upper}"
                );
            }
        }
    }

    #[test]
    fn test_jitter_is_random() {
        let delays = (0..50)
            .map(|_| jittered_backoff(3, 2.0, None).as_nanos())
            .collect::<HashSet<_>>();
        assert!(delays.len() > 10, "only {} distinct delays", delays.len());
    }

    #[test]
    fn test_jitter_covers_the_whole_window() {
        let delays = (0..1_000)
            .map(|_| jittered_backoff(2, 2.0, None).as_secs_f64())
            .collect::<Vec<_>>();

        let lower = delays.iter().filter(|d| **d < 1.0).count();
        let upper = delays.iter().filter(|d| **d >= 3.0).count();
        assert!(lower > 50, "lower quarter undersampled: {lower}");
        assert!(upper > 50, "upper quarter undersampled: {upper}");
    }

    #[test]
    fn test_huge_attempt_without_cap_does_not_overflow() {
        let backoff = Backoff::Exponential { base: 2.0, cap: None };
        assert_eq!(
            backoff.ceiling(u32::MAX),
            Duration::from_secs_f64(MAX_UNCAPPED_DELAY_SECS)
        );
        assert!(backoff.delay(5_000) <= backoff.ceiling(5_000));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(StatusClass::of(200), StatusClass::Success);
        assert_eq!(StatusClass::of(204), StatusClass::Success);
        assert_eq!(StatusClass::of(400), StatusClass::BadRequest);
        assert_eq!(StatusClass::of(401), StatusClass::Unauthorized);
        assert_eq!(StatusClass::of(403), StatusClass::Forbidden);
        assert_eq!(StatusClass::of(404), StatusClass::Unexpected);
        assert!(StatusClass::of(429).retryable());
        assert!(StatusClass::of(503).retryable());
        assert!(!StatusClass::of(401).retryable());
    }

    #[test]
    fn test_attempt_budget_counts_the_first_attempt() {
        let config = RetryConfig::exponential(3, 2.0, None);

        assert!(config.has_attempts_left(0));
        assert!(config.has_attempts_left(1));
        assert!(!config.has_attempts_left(2));
        assert!(!RetryConfig::no_retry().has_attempts_left(0));
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default().with_network_delay(Duration::from_millis(250));

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_backoff, Backoff::None);
        assert_eq!(config.network_backoff.delay(4), Duration::from_millis(250));
        assert!(config.delay_for_attempt(0) <= Duration::from_secs(1));
    }
}
