//! Per-partner-class policy bundles.
//!
//! Policies are built once at startup, wrapped in `Arc`, and never mutated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pointgate_ledger::PartnerClass;
use serde::{Deserialize, Serialize};

/// Admission algorithm backing a partner's rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Permits reset to the ceiling at the start of every window.
    #[default]
    FixedWindow,
    /// GCRA: one permit every `window / permits`, bursting up to `permits`.
    Smooth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub permits: u32,
    pub window: Duration,
    /// How long a caller may wait for a permit before being throttled.
    pub wait_timeout: Duration,
    pub algorithm: RateLimitAlgorithm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerPolicy {
    pub sliding_window_size: usize,
    /// Percentage in `(0, 100]`.
    pub failure_rate_threshold: f64,
    pub slow_call_duration_threshold: Duration,
    /// Percentage in `(0, 100]`.
    pub slow_call_rate_threshold: f64,
    pub open_duration: Duration,
    pub half_open_trial_calls: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread each delay by +/- 50%.
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartnerPolicy {
    pub partner_class: PartnerClass,
    pub rate_limit: RateLimitPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub retry: RetryPolicy,
}

impl CircuitBreakerPolicy {
    pub fn standard() -> Self {
        Self {
            sliding_window_size: 10,
            failure_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(2),
            slow_call_rate_threshold: 50.0,
            open_duration: Duration::from_secs(10),
            half_open_trial_calls: 3,
        }
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }
}

impl PartnerPolicy {
    fn with_permits(partner_class: PartnerClass, permits: u32) -> Self {
        Self {
            partner_class,
            rate_limit: RateLimitPolicy {
                permits,
                window: Duration::from_secs(1),
                wait_timeout: Duration::ZERO,
                algorithm: RateLimitAlgorithm::FixedWindow,
            },
            circuit_breaker: CircuitBreakerPolicy::standard(),
            retry: RetryPolicy::standard(),
        }
    }

    pub fn mart_default() -> Self {
        Self::with_permits(PartnerClass::Mart, 100)
    }

    pub fn convenience_default() -> Self {
        Self::with_permits(PartnerClass::Convenience, 50)
    }

    pub fn online_default() -> Self {
        Self::with_permits(PartnerClass::Online, 200)
    }

    pub fn default_for(partner_class: PartnerClass) -> Self {
        match partner_class {
            PartnerClass::Mart => Self::mart_default(),
            PartnerClass::Convenience => Self::convenience_default(),
            PartnerClass::Online => Self::online_default(),
        }
    }
}

/// Immutable lookup of one policy per partner class.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    policies: BTreeMap<PartnerClass, Arc<PartnerPolicy>>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new(PartnerClass::ALL.into_iter().map(PartnerPolicy::default_for))
    }
}

impl PolicySet {
    /// Later policies for the same class replace earlier ones. Missing classes get defaults.
    pub fn new(policies: impl IntoIterator<Item = PartnerPolicy>) -> Self {
        let mut map: BTreeMap<PartnerClass, Arc<PartnerPolicy>> = PartnerClass::ALL
            .into_iter()
            .map(|class| (class, Arc::new(PartnerPolicy::default_for(class))))
            .collect();
        for policy in policies {
            map.insert(policy.partner_class, Arc::new(policy));
        }
        Self { policies: map }
    }

    pub fn get(&self, partner_class: PartnerClass) -> Arc<PartnerPolicy> {
        match self.policies.get(&partner_class) {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(PartnerPolicy::default_for(partner_class)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PartnerPolicy>> {
        self.policies.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_defaults_differ_only_in_permits() {
        let mart = PartnerPolicy::mart_default();
        let convenience = PartnerPolicy::convenience_default();
        let online = PartnerPolicy::online_default();

        assert_eq!(mart.rate_limit.permits, 100);
        assert_eq!(convenience.rate_limit.permits, 50);
        assert_eq!(online.rate_limit.permits, 200);
        assert_eq!(mart.circuit_breaker, online.circuit_breaker);
        assert_eq!(convenience.retry.max_attempts, 3);
        assert_eq!(
            convenience.retry.backoff.initial_delay,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn policy_set_replaces_given_classes_only() {
        let mut custom = PartnerPolicy::online_default();
        custom.rate_limit.permits = 7;

        let set = PolicySet::new([custom]);

        assert_eq!(set.get(PartnerClass::Online).rate_limit.permits, 7);
        assert_eq!(set.get(PartnerClass::Mart).rate_limit.permits, 100);
        assert_eq!(set.iter().count(), 3);
    }
}
