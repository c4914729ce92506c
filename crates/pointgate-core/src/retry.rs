//! Retry classification and exponential backoff.

use std::time::Duration;

use crate::downstream::DownstreamError;
use crate::policy::{BackoffPolicy, RetryPolicy};

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based): `initial * multiplier^retry`, capped.
    ///
    /// With jitter enabled the delay is spread by +/- 50% and may exceed the cap.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scale = self.multiplier.max(1.0).powi(exponent);
        let seconds = self.initial_delay.as_secs_f64() * scale;
        let capped_seconds = seconds.min(self.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped_seconds.max(0.0));

        if self.jitter {
            let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
            let random_offset = fastrand::u64(0..=(jitter_ms * 2));
            let total_ms = delay.as_millis() as i64 + (random_offset as i64 - jitter_ms as i64);
            delay = Duration::from_millis(total_ms.max(0) as u64);
        }

        delay
    }
}

/// Whether an error may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Failures the engine can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind<'a> {
    Downstream(&'a DownstreamError),
    Throttled,
    CircuitOpen,
    Invalid,
}

/// Why the engine stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Terminal,
    AttemptsExhausted,
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

/// Pure retry decisions for one partner class. It never sleeps.
#[derive(Debug, Clone)]
pub struct RetryPolicyEngine {
    policy: RetryPolicy,
}

impl RetryPolicyEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts.max(1)
    }

    pub fn classify(failure: FailureKind<'_>) -> ErrorClass {
        match failure {
            FailureKind::Downstream(error) if error.retryable() => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }

    /// Decide after attempt number `attempt` (1-based) failed with `failure`.
    pub fn decide(&self, failure: FailureKind<'_>, attempt: u32) -> RetryDecision {
        if Self::classify(failure) == ErrorClass::Terminal {
            return RetryDecision::GiveUp(GiveUpReason::Terminal);
        }
        if attempt >= self.max_attempts() {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }
        RetryDecision::RetryAfter(self.policy.backoff.delay(attempt.saturating_sub(1)))
    }

    /// Minimum spacing the scheduler keeps after a record's latest reconciliation attempt.
    pub fn reconcile_delay(&self, retry_count: u32) -> Duration {
        self.policy.backoff.delay(retry_count.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RetryPolicyEngine {
        RetryPolicyEngine::new(RetryPolicy::standard())
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        };

        for _ in 0..10 {
            for retry in 0..5 {
                let expected = (100.0 * 2_f64.powi(retry as i32)).min(1000.0);
                let delay_ms = backoff.delay(retry).as_millis() as f64;
                assert!(delay_ms >= expected * 0.49, "retry={retry}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "retry={retry}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn retryable_errors_back_off_until_attempts_run_out() {
        let engine = engine();
        let timeout = DownstreamError::Timeout { timeout_ms: 500 };

        assert_eq!(
            engine.decide(FailureKind::Downstream(&timeout), 1),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(
            engine.decide(FailureKind::Downstream(&timeout), 2),
            RetryDecision::RetryAfter(Duration::from_millis(1_000))
        );
        assert_eq!(
            engine.decide(FailureKind::Downstream(&timeout), 3),
            RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted)
        );
    }

    #[test]
    fn terminal_failures_are_never_retried() {
        let engine = engine();
        let rejected = DownstreamError::Client {
            status: 400,
            message: String::from("bad member"),
        };
        let undecodable = DownstreamError::Decode {
            message: String::from("missing points"),
        };

        for failure in [
            FailureKind::Downstream(&rejected),
            FailureKind::Downstream(&undecodable),
            FailureKind::Throttled,
            FailureKind::CircuitOpen,
            FailureKind::Invalid,
        ] {
            assert_eq!(RetryPolicyEngine::classify(failure), ErrorClass::Terminal);
            assert_eq!(
                engine.decide(failure, 1),
                RetryDecision::GiveUp(GiveUpReason::Terminal)
            );
        }
    }

    #[test]
    fn server_and_connection_errors_are_retryable() {
        let server = DownstreamError::Server {
            status: 503,
            message: String::from("unavailable"),
        };
        let connection = DownstreamError::Connection {
            message: String::from("refused"),
        };

        assert_eq!(
            RetryPolicyEngine::classify(FailureKind::Downstream(&server)),
            ErrorClass::Retryable
        );
        assert_eq!(
            RetryPolicyEngine::classify(FailureKind::Downstream(&connection)),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn delay_sequence_is_non_decreasing() {
        let engine = engine();
        let delays: Vec<Duration> = (0..8).map(|count| engine.reconcile_delay(count)).collect();

        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[7], Duration::from_secs(5));
    }
}
