//! Exponential backoff with a quiet-period reset and a lifetime restart budget.
//!
//! The scheduler is a pure step function over [`BackoffState`]:
//!
//! ```text
//! (state, failure at T) ─► advance ─► (state', Retry { delay } | Exhausted { restarts })
//! ```
//!
//! On every failure:
//! 1. `restart_count` goes up by one (never reset)
//! 2. if the budget is finite and `restart_count` exceeds it → `Exhausted`
//! 3. otherwise, if `T - last_failure >= recovery_period` the delay resets to
//!    `min_backoff`, else it doubles from the previous delay, capped at `max_backoff`
//!
//! The quiet-period reset applies to the delay only. The restart budget is a
//! lifetime counter, not a windowed one.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::FlowError;

// =============================================================================
// Restart Budget
// =============================================================================

/// How many failures a source tolerates before failing permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartBudget {
    /// Tolerate arbitrarily many failures.
    Unlimited,
    /// Tolerate this many restarts; the failure after that is terminal.
    ///
    /// `Limited(0)` makes the first failure terminal.
    Limited(u32),
}

impl RestartBudget {
    /// Interpret a signed restart count: negative means unlimited.
    pub fn from_signed(max_restarts: i64) -> Self {
        if max_restarts < 0 {
            RestartBudget::Unlimited
        } else {
            RestartBudget::Limited(u32::try_from(max_restarts).unwrap_or(u32::MAX))
        }
    }

    /// Returns true if `restart_count` is beyond this budget.
    pub fn is_exceeded_by(&self, restart_count: u32) -> bool {
        match self {
            RestartBudget::Unlimited => false,
            RestartBudget::Limited(max) => restart_count > *max,
        }
    }
}

impl fmt::Display for RestartBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartBudget::Unlimited => write!(f, "unlimited"),
            RestartBudget::Limited(n) => write!(f, "{}", n),
        }
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Validated backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min_backoff: Duration,
    max_backoff: Duration,
    restart_budget: RestartBudget,
    recovery_period: Duration,
}

impl BackoffPolicy {
    /// Create a policy.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidConfig`] if `min_backoff > max_backoff`.
    pub fn new(
        min_backoff: Duration,
        max_backoff: Duration,
        restart_budget: RestartBudget,
        recovery_period: Duration,
    ) -> Result<Self, FlowError> {
        if min_backoff > max_backoff {
            return Err(FlowError::invalid(
                "min_backoff",
                format!(
                    "must not exceed max_backoff ({:?} > {:?})",
                    min_backoff, max_backoff
                ),
            ));
        }
        Ok(Self {
            min_backoff,
            max_backoff,
            restart_budget,
            recovery_period,
        })
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn restart_budget(&self) -> RestartBudget {
        self.restart_budget
    }

    pub fn recovery_period(&self) -> Duration {
        self.recovery_period
    }
}

// =============================================================================
// Backoff State
// =============================================================================

/// Outcome of recording one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Resume after waiting `delay`.
    Retry {
        /// How long to wait before the next resumption.
        delay: Duration,
    },
    /// The budget is spent; fail permanently without delay.
    Exhausted {
        /// Lifetime restart count including this failure.
        restarts: u32,
    },
}

/// Failure history of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    restart_count: u32,
    /// `None` stands for "never failed" (an instant infinitely far back).
    last_failure: Option<Instant>,
    last_delay: Duration,
}

impl BackoffState {
    /// Fresh state for `policy`: no failures, delay at the minimum.
    pub fn initial(policy: &BackoffPolicy) -> Self {
        Self {
            restart_count: 0,
            last_failure: None,
            last_delay: policy.min_backoff,
        }
    }

    /// Record a failure at `at` and decide what happens next.
    pub fn advance(self, policy: &BackoffPolicy, at: Instant) -> (Self, BackoffDecision) {
        let restart_count = self.restart_count.saturating_add(1);

        if policy.restart_budget.is_exceeded_by(restart_count) {
            let next = Self {
                restart_count,
                ..self
            };
            return (
                next,
                BackoffDecision::Exhausted {
                    restarts: restart_count,
                },
            );
        }

        let quiet_long_enough = match self.last_failure {
            None => true,
            Some(last) => at.saturating_duration_since(last) >= policy.recovery_period,
        };

        let delay = if quiet_long_enough {
            policy.min_backoff
        } else {
            self.last_delay
                .checked_mul(2)
                .unwrap_or(policy.max_backoff)
                .min(policy.max_backoff)
        };

        let next = Self {
            restart_count,
            last_failure: Some(at),
            last_delay: delay,
        };
        (next, BackoffDecision::Retry { delay })
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }
}

// =============================================================================
// Backoff Scheduler
// =============================================================================

/// Stateful wrapper threading [`BackoffState`] through successive failures.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    policy: BackoffPolicy,
    state: BackoffState,
}

impl BackoffScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: BackoffState::initial(&policy),
            policy,
        }
    }

    /// Record a failure observed at `at`.
    pub fn on_failure(&mut self, at: Instant) -> BackoffDecision {
        let (state, decision) = self.state.advance(&self.policy, at);
        self.state = state;
        decision
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    /// Lifetime restart count.
    pub fn restarts(&self) -> u32 {
        self.state.restart_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: i64) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            RestartBudget::from_signed(max_restarts),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn delay_of(decision: BackoffDecision) -> Duration {
        match decision {
            BackoffDecision::Retry { delay } => delay,
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_min_greater_than_max_is_rejected() {
        let err = BackoffPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            RestartBudget::Unlimited,
            Duration::from_secs(10),
        )
        .unwrap_err();

        assert!(err.is_config());
    }

    #[test]
    fn test_restart_budget_from_signed() {
        assert_eq!(RestartBudget::from_signed(-1), RestartBudget::Unlimited);
        assert_eq!(RestartBudget::from_signed(0), RestartBudget::Limited(0));
        assert_eq!(RestartBudget::from_signed(5), RestartBudget::Limited(5));
        assert!(!RestartBudget::Unlimited.is_exceeded_by(u32::MAX));
        assert!(RestartBudget::Limited(0).is_exceeded_by(1));
        assert!(!RestartBudget::Limited(2).is_exceeded_by(2));
    }

    #[test]
    fn test_first_failure_uses_min_backoff() {
        let mut scheduler = BackoffScheduler::new(policy(-1));
        let decision = scheduler.on_failure(Instant::now());

        assert_eq!(delay_of(decision), Duration::from_millis(100));
        assert_eq!(scheduler.restarts(), 1);
    }

    #[test]
    fn test_delay_doubles_within_recovery_period_and_caps() {
        let mut scheduler = BackoffScheduler::new(policy(-1));
        let start = Instant::now();

        let delays: Vec<_> = (0..7)
            .map(|i| delay_of(scheduler.on_failure(start + Duration::from_millis(i * 50))))
            .map(|d| d.as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_quiet_period_resets_delay_but_not_restart_count() {
        let mut scheduler = BackoffScheduler::new(policy(-1));
        let start = Instant::now();

        scheduler.on_failure(start);
        scheduler.on_failure(start + Duration::from_secs(1));
        let before_reset = delay_of(scheduler.on_failure(start + Duration::from_secs(2)));
        assert_eq!(before_reset, Duration::from_millis(400));

        // exactly one recovery period later counts as quiet
        let after_reset = delay_of(scheduler.on_failure(start + Duration::from_secs(12)));
        assert_eq!(after_reset, Duration::from_millis(100));
        assert_eq!(scheduler.restarts(), 4);
    }

    #[test]
    fn test_zero_budget_exhausts_on_first_failure() {
        let mut scheduler = BackoffScheduler::new(policy(0));

        assert_eq!(
            scheduler.on_failure(Instant::now()),
            BackoffDecision::Exhausted { restarts: 1 }
        );
    }

    #[test]
    fn test_budget_counts_lifetime_failures() {
        let mut scheduler = BackoffScheduler::new(policy(2));
        let start = Instant::now();

        // failures far apart still consume the budget
        assert!(matches!(
            scheduler.on_failure(start),
            BackoffDecision::Retry { .. }
        ));
        assert!(matches!(
            scheduler.on_failure(start + Duration::from_secs(60)),
            BackoffDecision::Retry { .. }
        ));
        assert_eq!(
            scheduler.on_failure(start + Duration::from_secs(120)),
            BackoffDecision::Exhausted { restarts: 3 }
        );
    }

    #[test]
    fn test_advance_is_pure() {
        let policy = policy(-1);
        let state = BackoffState::initial(&policy);
        let at = Instant::now();

        let (a, da) = state.advance(&policy, at);
        let (b, db) = state.advance(&policy, at);

        assert_eq!(a, b);
        assert_eq!(da, db);
        assert_eq!(state.restart_count(), 0);
        assert_eq!(a.last_failure(), Some(at));
        assert_eq!(a.last_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_equal_min_and_max_is_constant() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(250),
            Duration::from_millis(250),
            RestartBudget::Unlimited,
            Duration::from_secs(10),
        )
        .unwrap();
        let mut scheduler = BackoffScheduler::new(policy);
        let start = Instant::now();

        for i in 0..4 {
            let delay = delay_of(scheduler.on_failure(start + Duration::from_millis(i)));
            assert_eq!(delay, Duration::from_millis(250));
        }
    }
}
