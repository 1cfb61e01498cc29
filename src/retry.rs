//! Pluggable retry policies.
//!
//! A policy is a pure function of the attempt count and the last error;
//! the retry stage of the pipeline consults it exactly once per failure
//! and sleeps for the returned duration (subject to the stage's one
//! second floor, which exists so a user-supplied policy returning zero
//! cannot spin the CPU).

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::IotHubError;

/// What the retry stage should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given duration, then try again.
    RetryAfter(Duration),
    /// Give up and surface the last error.
    Stop,
}

/// Decides whether a failed operation is tried again.
///
/// `attempt` starts at 1 for the first failure. Implementations must be
/// cheap and side-effect free; they may be consulted from many concurrent
/// operations.
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    fn should_retry(&self, attempt: u32, last_error: &IotHubError) -> RetryDecision;
}

/// Exponential backoff with jitter, unbounded attempts.
///
/// Delays grow as `initial * 2^(attempt-1)`, capped at `max`, each
/// multiplied by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            jitter: 0.25,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // cap the shift so the multiplication cannot overflow
        let exponent = attempt.saturating_sub(1).min(20);
        let uncapped = self.initial.saturating_mul(1u32 << exponent);
        let base = uncapped.min(self.max);
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }
}

impl Default for ExponentialBackoff {
    /// 100 ms initial, 10 s cap.
    fn default() -> Self {
        ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, last_error: &IotHubError) -> RetryDecision {
        if !last_error.is_transient() {
            return RetryDecision::Stop;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32, _last_error: &IotHubError) -> RetryDecision {
        RetryDecision::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn transient_error() -> IotHubError {
        IotHubError::new(ErrorCode::NetworkErrors, "connection reset")
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.0,
        };
        let err = transient_error();
        assert_eq!(
            policy.should_retry(1, &err),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.should_retry(4, &err),
            RetryDecision::RetryAfter(Duration::from_millis(800))
        );
        // far past the cap, including attempts that would overflow a shift
        assert_eq!(
            policy.should_retry(64, &err),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn backoff_jitter_stays_in_bounds() {
        let policy = ExponentialBackoff::default();
        let err = transient_error();
        for attempt in 1..=12 {
            match policy.should_retry(attempt, &err) {
                RetryDecision::RetryAfter(delay) => {
                    assert!(delay <= Duration::from_millis(12_500), "delay {delay:?}");
                }
                RetryDecision::Stop => panic!("transient error must be retried"),
            }
        }
    }

    #[test]
    fn backoff_stops_on_fatal_errors() {
        let policy = ExponentialBackoff::default();
        let err = IotHubError::new(ErrorCode::Unauthorized, "bad credential");
        assert_eq!(policy.should_retry(1, &err), RetryDecision::Stop);
    }

    #[test]
    fn no_retry_always_stops() {
        assert_eq!(
            NoRetry.should_retry(1, &transient_error()),
            RetryDecision::Stop
        );
    }
}
