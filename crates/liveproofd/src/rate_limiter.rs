//! Per-caller throttling of new liveness sessions.
//!
//! Only outcomes the caller is responsible for count as strikes: a challenge
//! left to time out or evidence the trust authority rejected. Cancellations,
//! setup failures and an unreachable authority are neutral; a successful
//! session forgets the caller entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use liveproof_core::FailureReason;

/// Limits applied to every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Strikes within `window` that trigger a lockout.
    pub max_failures: u32,
    /// Strikes older than this (counted from the first one) are forgotten.
    pub window: Duration,
    /// How long a locked-out caller is refused new sessions.
    pub lockout: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

/// What a finished session means for its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    Clear,
    Count,
    Ignore,
}

impl Strike {
    /// Classify a terminal outcome (`None` is success).
    pub fn for_outcome(reason: Option<FailureReason>) -> Self {
        match reason {
            None => Self::Clear,
            Some(FailureReason::Timeout | FailureReason::VerificationRejected) => Self::Count,
            Some(
                FailureReason::Cancelled
                | FailureReason::SetupFailure
                | FailureReason::VerificationUnreachable,
            ) => Self::Ignore,
        }
    }
}

#[derive(Debug)]
struct Strikes {
    count: u32,
    since: Instant,
    locked_until: Option<Instant>,
}

impl Strikes {
    fn first(now: Instant) -> Self {
        Self {
            count: 0,
            since: now,
            locked_until: None,
        }
    }

    /// Neither locked nor holding strikes inside the window.
    fn is_stale(&self, now: Instant, policy: &RateLimitPolicy) -> bool {
        match self.locked_until {
            Some(until) => now >= until,
            None => now.duration_since(self.since) >= policy.window,
        }
    }
}

/// Strike ledger keyed by caller (`uid:<n>` or a unique bus name).
///
/// Records exist only while they matter: callers with nothing recorded are
/// never inserted, and stale records are pruned on every check.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    callers: HashMap<String, Strikes>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            callers: HashMap::new(),
        }
    }

    /// `Err(message)` while the caller is locked out.
    pub fn check(&mut self, caller: &str) -> Result<(), String> {
        self.check_at(caller, Instant::now())
    }

    /// Apply a finished session's outcome to its caller.
    pub fn record_outcome(&mut self, caller: &str, reason: Option<FailureReason>) {
        self.record_outcome_at(caller, reason, Instant::now());
    }

    /// Number of callers with live strikes or an active lockout.
    pub fn tracked_callers(&self) -> usize {
        self.callers.len()
    }

    fn check_at(&mut self, caller: &str, now: Instant) -> Result<(), String> {
        self.prune(now);
        match self.callers.get(caller).and_then(|s| s.locked_until) {
            Some(until) => Err(format!(
                "too many failed liveness attempts; try again in {}s",
                until.duration_since(now).as_secs()
            )),
            None => Ok(()),
        }
    }

    fn record_outcome_at(&mut self, caller: &str, reason: Option<FailureReason>, now: Instant) {
        match Strike::for_outcome(reason) {
            Strike::Clear => {
                self.callers.remove(caller);
            }
            Strike::Ignore => {}
            Strike::Count => self.strike(caller, now),
        }
    }

    fn strike(&mut self, caller: &str, now: Instant) {
        let policy = self.policy;
        let strikes = self
            .callers
            .entry(caller.to_string())
            .or_insert_with(|| Strikes::first(now));
        if strikes.is_stale(now, &policy) {
            *strikes = Strikes::first(now);
        }
        strikes.count += 1;

        if strikes.count >= policy.max_failures {
            strikes.locked_until = Some(now + policy.lockout);
            tracing::warn!(
                caller,
                failures = strikes.count,
                lockout_secs = policy.lockout.as_secs(),
                "caller locked out"
            );
        } else {
            tracing::debug!(
                caller,
                failures = strikes.count,
                max = policy.max_failures,
                "liveness strike recorded"
            );
        }
    }

    fn prune(&mut self, now: Instant) {
        let policy = self.policy;
        self.callers.retain(|_, s| !s.is_stale(now, &policy));
    }
}
