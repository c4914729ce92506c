//! Gateway configuration.
//!
//! Built-in defaults, then an optional YAML file, then `POINTGATE_*`
//! environment overrides. Durations are milliseconds.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use pointgate_ledger::{LedgerConfig, PartnerClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{PartnerPolicy, PolicySet, RateLimitAlgorithm};
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub downstream: DownstreamConfig,
    pub ledger: LedgerSection,
    pub events: EventsConfig,
    pub scheduler: SchedulerConfig,
    pub partners: PartnersConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownstreamConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            name: String::from("point-service"),
            base_url: String::from("http://localhost:8081"),
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    /// Database file. Falls back to `$POINTGATE_HOME/ledger.duckdb`.
    pub path: Option<PathBuf>,
    pub max_pool_size: usize,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            path: None,
            max_pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    /// Without a URL, events are only logged.
    pub nats_url: Option<String>,
    pub subject: String,
    /// Longest a publish may hold up a request before it is abandoned.
    pub publish_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject: String::from("points.lifecycle"),
            publish_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub max_retry_count: u32,
    pub concurrency: usize,
    pub wait_budget_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_retry_count: 3,
            concurrency: 8,
            wait_budget_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_millis(self.interval_ms),
            max_retry_count: self.max_retry_count,
            concurrency: self.concurrency,
            wait_budget: Duration::from_millis(self.wait_budget_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartnersConfig {
    pub mart: PartnerOverrides,
    pub convenience: PartnerOverrides,
    pub online: PartnerOverrides,
}

impl PartnersConfig {
    pub fn get(&self, partner_class: PartnerClass) -> &PartnerOverrides {
        match partner_class {
            PartnerClass::Mart => &self.mart,
            PartnerClass::Convenience => &self.convenience,
            PartnerClass::Online => &self.online,
        }
    }
}

/// Partial policy. Unset fields keep the partner class default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartnerOverrides {
    pub rate_limit: RateLimitOverrides,
    pub circuit_breaker: CircuitBreakerOverrides,
    pub retry: RetryOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitOverrides {
    pub permits: Option<u32>,
    pub window_ms: Option<u64>,
    pub wait_timeout_ms: Option<u64>,
    pub algorithm: Option<RateLimitAlgorithm>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerOverrides {
    pub sliding_window_size: Option<usize>,
    pub failure_rate_threshold: Option<f64>,
    pub slow_call_duration_threshold_ms: Option<u64>,
    pub slow_call_rate_threshold: Option<f64>,
    pub open_duration_ms: Option<u64>,
    pub half_open_trial_calls: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

impl From<&PartnerPolicy> for PartnerOverrides {
    /// Fully populated form of an effective policy, in configuration units.
    fn from(policy: &PartnerPolicy) -> Self {
        let breaker = &policy.circuit_breaker;
        let backoff = &policy.retry.backoff;
        Self {
            rate_limit: RateLimitOverrides {
                permits: Some(policy.rate_limit.permits),
                window_ms: Some(millis(policy.rate_limit.window)),
                wait_timeout_ms: Some(millis(policy.rate_limit.wait_timeout)),
                algorithm: Some(policy.rate_limit.algorithm),
            },
            circuit_breaker: CircuitBreakerOverrides {
                sliding_window_size: Some(breaker.sliding_window_size),
                failure_rate_threshold: Some(breaker.failure_rate_threshold),
                slow_call_duration_threshold_ms: Some(millis(breaker.slow_call_duration_threshold)),
                slow_call_rate_threshold: Some(breaker.slow_call_rate_threshold),
                open_duration_ms: Some(millis(breaker.open_duration)),
                half_open_trial_calls: Some(breaker.half_open_trial_calls),
            },
            retry: RetryOverrides {
                max_attempts: Some(policy.retry.max_attempts),
                initial_delay_ms: Some(millis(backoff.initial_delay)),
                max_delay_ms: Some(millis(backoff.max_delay)),
                multiplier: Some(backoff.multiplier),
                jitter: Some(backoff.jitter),
            },
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PartnerOverrides {
    pub fn apply(&self, mut policy: PartnerPolicy) -> PartnerPolicy {
        let rate = &self.rate_limit;
        if let Some(permits) = rate.permits {
            policy.rate_limit.permits = permits;
        }
        if let Some(window_ms) = rate.window_ms {
            policy.rate_limit.window = Duration::from_millis(window_ms);
        }
        if let Some(wait_ms) = rate.wait_timeout_ms {
            policy.rate_limit.wait_timeout = Duration::from_millis(wait_ms);
        }
        if let Some(algorithm) = rate.algorithm {
            policy.rate_limit.algorithm = algorithm;
        }

        let breaker = &self.circuit_breaker;
        let target = &mut policy.circuit_breaker;
        if let Some(size) = breaker.sliding_window_size {
            target.sliding_window_size = size;
        }
        if let Some(threshold) = breaker.failure_rate_threshold {
            target.failure_rate_threshold = threshold;
        }
        if let Some(slow_ms) = breaker.slow_call_duration_threshold_ms {
            target.slow_call_duration_threshold = Duration::from_millis(slow_ms);
        }
        if let Some(threshold) = breaker.slow_call_rate_threshold {
            target.slow_call_rate_threshold = threshold;
        }
        if let Some(open_ms) = breaker.open_duration_ms {
            target.open_duration = Duration::from_millis(open_ms);
        }
        if let Some(trials) = breaker.half_open_trial_calls {
            target.half_open_trial_calls = trials;
        }

        let retry = &self.retry;
        if let Some(max_attempts) = retry.max_attempts {
            policy.retry.max_attempts = max_attempts;
        }
        if let Some(initial_ms) = retry.initial_delay_ms {
            policy.retry.backoff.initial_delay = Duration::from_millis(initial_ms);
        }
        if let Some(max_ms) = retry.max_delay_ms {
            policy.retry.backoff.max_delay = Duration::from_millis(max_ms);
        }
        if let Some(multiplier) = retry.multiplier {
            policy.retry.backoff.multiplier = multiplier;
        }
        if let Some(jitter) = retry.jitter {
            policy.retry.backoff.jitter = jitter;
        }
        policy
    }
}

impl GatewayConfig {
    /// Read `path` if given, apply process environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `POINTGATE_*` overrides resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(path) = lookup("POINTGATE_LEDGER_PATH") {
            self.ledger.path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("POINTGATE_DOWNSTREAM_URL") {
            self.downstream.base_url = url;
        }
        if let Some(url) = lookup("POINTGATE_NATS_URL") {
            self.events.nats_url = Some(url);
        }
        if let Some(subject) = lookup("POINTGATE_NATS_SUBJECT") {
            self.events.subject = subject;
        }
        if let Some(value) = lookup("POINTGATE_RETRY_MAX_COUNT") {
            self.scheduler.max_retry_count = parse_env("POINTGATE_RETRY_MAX_COUNT", value)?;
        }
        if let Some(value) = lookup("POINTGATE_RETRY_INTERVAL_MS") {
            self.scheduler.interval_ms = parse_env("POINTGATE_RETRY_INTERVAL_MS", value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downstream.base_url.trim().is_empty() {
            return Err(invalid("downstream.base_url must not be empty"));
        }
        if self.downstream.timeout_ms == 0 {
            return Err(invalid("downstream.timeout_ms must be positive"));
        }
        if self.ledger.max_pool_size == 0 {
            return Err(invalid("ledger.max_pool_size must be positive"));
        }
        if self.events.subject.trim().is_empty() {
            return Err(invalid("events.subject must not be empty"));
        }
        if self.events.publish_timeout_ms == 0 {
            return Err(invalid("events.publish_timeout_ms must be positive"));
        }
        if self.scheduler.interval_ms == 0 {
            return Err(invalid("scheduler.interval_ms must be positive"));
        }
        if self.scheduler.max_retry_count == 0 {
            return Err(invalid("scheduler.max_retry_count must be positive"));
        }
        if self.scheduler.concurrency == 0 {
            return Err(invalid("scheduler.concurrency must be positive"));
        }

        for policy in self.policy_set().iter() {
            validate_policy(policy)?;
        }
        Ok(())
    }

    /// Effective policies: class defaults with the configured overrides applied.
    pub fn policy_set(&self) -> PolicySet {
        PolicySet::new(PartnerClass::ALL.into_iter().map(|class| {
            self.partners
                .get(class)
                .apply(PartnerPolicy::default_for(class))
        }))
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        let mut config = LedgerConfig::default();
        if let Some(path) = &self.ledger.path {
            config.db_path = path.clone();
        }
        config.max_pool_size = self.ledger.max_pool_size;
        config
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream.timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.events.publish_timeout_ms)
    }
}

fn validate_policy(policy: &PartnerPolicy) -> Result<(), ConfigError> {
    let class = policy.partner_class.key();
    let rate = &policy.rate_limit;
    if rate.permits == 0 {
        return Err(invalid(format!("partners.{class}.rate_limit.permits must be positive")));
    }
    if rate.window.is_zero() {
        return Err(invalid(format!("partners.{class}.rate_limit.window_ms must be positive")));
    }

    let breaker = &policy.circuit_breaker;
    if breaker.sliding_window_size == 0 {
        return Err(invalid(format!(
            "partners.{class}.circuit_breaker.sliding_window_size must be positive"
        )));
    }
    for (field, value) in [
        ("failure_rate_threshold", breaker.failure_rate_threshold),
        ("slow_call_rate_threshold", breaker.slow_call_rate_threshold),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(invalid(format!(
                "partners.{class}.circuit_breaker.{field} must be within (0, 100], got {value}"
            )));
        }
    }
    if breaker.half_open_trial_calls == 0 {
        return Err(invalid(format!(
            "partners.{class}.circuit_breaker.half_open_trial_calls must be positive"
        )));
    }

    let retry = &policy.retry;
    if retry.max_attempts == 0 {
        return Err(invalid(format!("partners.{class}.retry.max_attempts must be positive")));
    }
    if !(retry.backoff.multiplier >= 1.0) {
        return Err(invalid(format!(
            "partners.{class}.retry.multiplier must be at least 1, got {}",
            retry.backoff.multiplier
        )));
    }
    if retry.backoff.max_delay < retry.backoff.initial_delay {
        return Err(invalid(format!(
            "partners.{class}.retry.max_delay_ms must not be below initial_delay_ms"
        )));
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
