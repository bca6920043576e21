//! Cycle supervisor state machine.
//!
//! The driver in `supervisor` feeds each cycle's exit into
//! [`next_transition`] and performs the side effects the transition names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Supervisor state over the life of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleState {
    Running { cycle: u32 },
    Completed,
    Failed { reason: String },
    MaxCyclesReached,
}

impl CycleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CycleState::Running { .. })
    }
}

/// Exponential backoff with a fixed ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-indexed): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// How a cycle ended, as observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleExit {
    /// Loop reached a terminal outcome (promise, cap, cancel).
    Completed,
    /// Context threshold crossed; a handoff is needed.
    ContextThreshold,
    /// Non-zero exit, spawn failure or timeout.
    Failed {
        code: Option<i32>,
        detail: String,
        retryable: bool,
    },
}

impl CycleExit {
    pub fn from_exit_code(code: Option<i32>, detail: impl Into<String>) -> Self {
        match code {
            Some(exit_codes::OK) => CycleExit::Completed,
            Some(exit_codes::CONTEXT_THRESHOLD) => CycleExit::ContextThreshold,
            code => CycleExit::Failed {
                code,
                detail: detail.into(),
                retryable: true,
            },
        }
    }
}

/// Action the supervisor must take after a cycle exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete,
    /// Save a handoff and launch `next_cycle`.
    Handoff { next_cycle: u32 },
    /// Save a handoff and stop; the cycle budget is spent.
    MaxCyclesReached { last_cycle: u32 },
    /// Relaunch the same cycle after `delay`.
    Retry { attempt: u32, delay: Duration },
    Fail { reason: String },
}

impl Transition {
    /// State the supervisor is in after applying this transition to `cycle`.
    pub fn next_state(&self, cycle: u32) -> CycleState {
        match self {
            Transition::Complete => CycleState::Completed,
            Transition::Handoff { next_cycle } => CycleState::Running { cycle: *next_cycle },
            Transition::MaxCyclesReached { .. } => CycleState::MaxCyclesReached,
            Transition::Retry { .. } => CycleState::Running { cycle },
            Transition::Fail { reason } => CycleState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// Decide the transition for `exit` of `cycle`.
///
/// `retries_used` counts retries already spent on this cycle. A `max_cycles`
/// of 0 means unbounded.
pub fn next_transition(
    cycle: u32,
    max_cycles: u32,
    exit: &CycleExit,
    retries_used: u32,
    policy: &RetryPolicy,
) -> Transition {
    match exit {
        CycleExit::Completed => Transition::Complete,
        CycleExit::ContextThreshold => {
            let next_cycle = cycle.saturating_add(1);
            if max_cycles > 0 && next_cycle > max_cycles {
                Transition::MaxCyclesReached { last_cycle: cycle }
            } else {
                Transition::Handoff { next_cycle }
            }
        }
        CycleExit::Failed {
            code,
            detail,
            retryable,
        } => {
            let describe = || match code {
                Some(code) => format!("cycle {cycle} exited with code {code}: {detail}"),
                None => format!("cycle {cycle} failed: {detail}"),
            };
            if !retryable {
                return Transition::Fail { reason: describe() };
            }
            if retries_used >= policy.max_retries {
                return Transition::Fail {
                    reason: format!("{} (after {retries_used} retries)", describe()),
                };
            }
            let attempt = retries_used + 1;
            Transition::Retry {
                attempt,
                delay: policy.delay_for(attempt),
            }
        }
    }
}
