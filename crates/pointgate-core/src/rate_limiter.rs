//! Per-partner-class admission limits.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use pointgate_ledger::PartnerClass;
use tokio::time::Instant;

use crate::policy::{PolicySet, RateLimitAlgorithm, RateLimitPolicy};

/// Result of a rate-limit admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Throttled,
}

impl Admission {
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    available: u32,
}

/// Refilling-permit counter: the ceiling is restored at the start of every window.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    permits: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(permits: u32, window: Duration) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            window: window.max(Duration::from_millis(1)),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                available: permits,
            }),
        }
    }

    /// Wait at most `wait_budget` for a permit. A zero budget never waits.
    ///
    /// Nothing is reserved while waiting, so dropping the future cannot leak a permit.
    pub async fn try_acquire(&self, wait_budget: Duration) -> Admission {
        let deadline = Instant::now() + wait_budget;
        loop {
            let next_refill = match self.try_take() {
                Ok(()) => return Admission::Granted,
                Err(next_refill) => next_refill,
            };
            if next_refill > deadline {
                return Admission::Throttled;
            }
            tokio::time::sleep_until(next_refill).await;
        }
    }

    /// Permits left in the current window.
    pub fn available_permits(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available
    }

    /// Take one permit, or report when the next window opens.
    fn try_take(&self) -> Result<(), Instant> {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.available == 0 {
            return Err(state.window_start + self.window);
        }
        state.available -= 1;
        Ok(())
    }

    fn refill(&self, state: &mut WindowState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed < self.window {
            return;
        }
        let windows = elapsed.as_nanos() / self.window.as_nanos();
        let windows = u32::try_from(windows).unwrap_or(u32::MAX);
        state.window_start += self.window.saturating_mul(windows);
        state.available = self.permits;
    }
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// GCRA limiter: one permit per `window / permits`, bursting up to `permits`.
pub struct SmoothLimiter {
    limiter: DirectRateLimiter,
}

impl SmoothLimiter {
    pub fn new(permits: u32, window: Duration) -> Self {
        Self {
            limiter: RateLimiter::direct(quota_from_window(window, permits)),
        }
    }

    pub async fn try_acquire(&self, wait_budget: Duration) -> Admission {
        if self.limiter.check().is_ok() {
            return Admission::Granted;
        }
        if wait_budget.is_zero() {
            return Admission::Throttled;
        }
        match tokio::time::timeout(wait_budget, self.limiter.until_ready()).await {
            Ok(()) => Admission::Granted,
            Err(_) => Admission::Throttled,
        }
    }
}

fn quota_from_window(window: Duration, permits: u32) -> Quota {
    let burst = NonZeroU32::new(permits.max(1)).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

/// A partner's limiter, selected by [`RateLimitAlgorithm`].
pub enum PartnerRateLimiter {
    FixedWindow(FixedWindowLimiter),
    Smooth(SmoothLimiter),
}

impl PartnerRateLimiter {
    pub fn from_policy(policy: &RateLimitPolicy) -> Self {
        match policy.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                Self::FixedWindow(FixedWindowLimiter::new(policy.permits, policy.window))
            }
            RateLimitAlgorithm::Smooth => {
                Self::Smooth(SmoothLimiter::new(policy.permits, policy.window))
            }
        }
    }

    pub async fn try_acquire(&self, wait_budget: Duration) -> Admission {
        match self {
            Self::FixedWindow(limiter) => limiter.try_acquire(wait_budget).await,
            Self::Smooth(limiter) => limiter.try_acquire(wait_budget).await,
        }
    }

    /// `None` for limiters that do not expose a permit count.
    pub fn available_permits(&self) -> Option<u32> {
        match self {
            Self::FixedWindow(limiter) => Some(limiter.available_permits()),
            Self::Smooth(_) => None,
        }
    }
}

/// One limiter per partner class, shared by live traffic and reconciliation.
pub struct RateLimiterRegistry {
    limiters: BTreeMap<PartnerClass, PartnerRateLimiter>,
}

impl RateLimiterRegistry {
    pub fn new(policies: &PolicySet) -> Self {
        let limiters = policies
            .iter()
            .map(|policy| {
                (
                    policy.partner_class,
                    PartnerRateLimiter::from_policy(&policy.rate_limit),
                )
            })
            .collect();
        Self { limiters }
    }

    pub async fn try_acquire(&self, partner_class: PartnerClass, wait_budget: Duration) -> Admission {
        match self.limiters.get(&partner_class) {
            Some(limiter) => limiter.try_acquire(wait_budget).await,
            None => Admission::Throttled,
        }
    }

    pub fn available_permits(&self, partner_class: PartnerClass) -> Option<u32> {
        self.limiters
            .get(&partner_class)
            .and_then(PartnerRateLimiter::available_permits)
    }
}
