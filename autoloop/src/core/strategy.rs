//! Strategy engine: decides how the agent should behave next.
//!
//! A total function over loop state and transcript analysis. Recovery is
//! checked first; otherwise the iteration count picks the phase.

use crate::core::state::LoopState;
use crate::core::types::{
    RepeatedError, StrategyAction, StrategyName, StrategyResult, TranscriptAnalysis,
};

/// Last iteration of the explore phase (inclusive).
pub const EXPLORE_UNTIL: u32 = 10;
/// Last iteration of the focused phase (inclusive).
pub const FOCUSED_UNTIL: u32 = 35;
/// Repeated-error count that forces recovery.
pub const REPEAT_THRESHOLD: u32 = 3;
/// Consecutive idle iterations that force recovery.
pub const STUCK_THRESHOLD: u32 = 5;

const EXPLORE_GUIDANCE: [&str; 3] = [
    "Try distinct approaches before committing to one.",
    "Map the codebase and record what you learn as LEARNING: lines.",
    "Prefer quick experiments over large rewrites.",
];

const FOCUSED_GUIDANCE: [&str; 3] = [
    "Commit to the most promising approach.",
    "Implement incrementally and run the tests after each change.",
    "Record concrete follow-ups as NEXT: lines.",
];

const CLEANUP_GUIDANCE: [&str; 3] = [
    "Finish remaining work and stabilize what exists.",
    "Fix failing tests and remove dead code.",
    "Avoid starting new features.",
];

const RECOVERY_GUIDANCE: [&str; 3] = [
    "Stop repeating the approach that keeps failing.",
    "Read the exact error output and address its root cause.",
    "Consider reverting recent changes to the last known-good state.",
];

pub fn guidance_for(strategy: StrategyName) -> Vec<String> {
    let lines: &[&str] = match strategy {
        StrategyName::Explore => &EXPLORE_GUIDANCE,
        StrategyName::Focused => &FOCUSED_GUIDANCE,
        StrategyName::Cleanup => &CLEANUP_GUIDANCE,
        StrategyName::Recovery => &RECOVERY_GUIDANCE,
    };
    lines.iter().map(|line| line.to_string()).collect()
}

/// Phase strategy for the iteration about to run, ignoring recovery.
pub fn phase_for(iteration: u32) -> StrategyName {
    match iteration {
        0..=EXPLORE_UNTIL => StrategyName::Explore,
        n if n <= FOCUSED_UNTIL => StrategyName::Focused,
        _ => StrategyName::Cleanup,
    }
}

/// Decide the next strategy. Never fails.
pub fn decide(state: Option<&LoopState>, analysis: Option<&TranscriptAnalysis>) -> StrategyResult {
    let (state, analysis) = match (state, analysis) {
        (Some(state), Some(analysis)) if !state.session_id.trim().is_empty() => (state, analysis),
        (None, _) => return fallback("loop state unavailable"),
        (Some(_), None) => return fallback("transcript analysis unavailable"),
        (Some(_), Some(_)) => return fallback("loop state has no session id"),
    };

    let progress = progress_clause(state.iteration, analysis.meaningful_changes);

    if let Some(trigger) = recovery_trigger(state, analysis) {
        return StrategyResult {
            strategy: StrategyName::Recovery,
            reason: format!("{trigger}; {progress}"),
            action: StrategyAction::Switch,
            guidance: guidance_for(StrategyName::Recovery),
        };
    }

    // Indexed by the iteration being scheduled, matching the prompt header.
    let scheduled = state.next_iteration();
    let strategy = phase_for(scheduled);
    let action = if strategy == state.strategy.current {
        StrategyAction::Continue
    } else {
        StrategyAction::Switch
    };
    StrategyResult {
        strategy,
        reason: format!("iteration {scheduled} is in the {strategy} phase; {progress}"),
        action,
        guidance: guidance_for(strategy),
    }
}

fn recovery_trigger(state: &LoopState, analysis: &TranscriptAnalysis) -> Option<String> {
    if let Some(offender) = worst_repeated(&analysis.repeated_errors) {
        return Some(format!(
            "repeated {} ({} occurrences)",
            offender.pattern, offender.count
        ));
    }
    if state.stuck_count >= STUCK_THRESHOLD {
        return Some(format!(
            "stuck for {} iterations without meaningful changes",
            state.stuck_count
        ));
    }
    None
}

/// Highest-count repeated error at or above the threshold, first on ties.
fn worst_repeated(repeated: &[RepeatedError]) -> Option<&RepeatedError> {
    repeated
        .iter()
        .filter(|r| r.count >= REPEAT_THRESHOLD)
        .fold(None, |best: Option<&RepeatedError>, r| match best {
            Some(b) if b.count >= r.count => Some(b),
            _ => Some(r),
        })
}

fn progress_clause(iteration: u32, meaningful: bool) -> &'static str {
    if meaningful {
        "making progress"
    } else if iteration > 1 {
        "warning: no meaningful changes in the last iteration"
    } else {
        "starting out"
    }
}

fn fallback(cause: &str) -> StrategyResult {
    StrategyResult {
        strategy: StrategyName::Explore,
        reason: format!("fallback: {cause}; defaulting to explore"),
        action: StrategyAction::Continue,
        guidance: guidance_for(StrategyName::Explore),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::core::state::LoopOptions;
    use crate::core::types::ErrorPattern;

    fn state_at(iteration: u32) -> LoopState {
        let mut state = LoopState::new(
            "session-1",
            "goal",
            &LoopOptions::default(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        state.iteration = iteration;
        state
    }

    fn progress() -> TranscriptAnalysis {
        TranscriptAnalysis {
            meaningful_changes: true,
            ..TranscriptAnalysis::default()
        }
    }

    #[test]
    fn phase_table_boundaries() {
        for (n, expected) in [
            (1, StrategyName::Explore),
            (10, StrategyName::Explore),
            (11, StrategyName::Focused),
            (35, StrategyName::Focused),
            (36, StrategyName::Cleanup),
            (500, StrategyName::Cleanup),
        ] {
            // `n` is the iteration being scheduled; `n - 1` have completed.
            let result = decide(Some(&state_at(n - 1)), Some(&progress()));
            assert_eq!(result.strategy, expected, "iteration {n}");
            assert!(result.reason.starts_with(&format!("iteration {n} ")), "{}", result.reason);
        }
    }

    #[test]
    fn phase_ignores_prior_strategy() {
        let mut state = state_at(5);
        state.strategy.current = StrategyName::Cleanup;
        let result = decide(Some(&state), Some(&progress()));
        assert_eq!(result.strategy, StrategyName::Explore);
        assert_eq!(result.action, StrategyAction::Switch);
    }

    #[test]
    fn switch_only_when_strategy_changes() {
        let mut state = state_at(12);
        state.strategy.current = StrategyName::Focused;
        let result = decide(Some(&state), Some(&progress()));
        assert_eq!(result.action, StrategyAction::Continue);

        state.strategy.current = StrategyName::Explore;
        let result = decide(Some(&state), Some(&progress()));
        assert_eq!(result.action, StrategyAction::Switch);
    }

    #[test]
    fn recovery_names_highest_repeated_error() {
        let analysis = TranscriptAnalysis {
            repeated_errors: vec![
                RepeatedError {
                    pattern: ErrorPattern::SyntaxError,
                    count: 2,
                },
                RepeatedError {
                    pattern: ErrorPattern::TestFailure,
                    count: 4,
                },
                RepeatedError {
                    pattern: ErrorPattern::Timeout,
                    count: 3,
                },
            ],
            ..TranscriptAnalysis::default()
        };
        let result = decide(Some(&state_at(20)), Some(&analysis));
        assert_eq!(result.strategy, StrategyName::Recovery);
        assert_eq!(result.action, StrategyAction::Switch);
        assert!(result.reason.contains("test failure"), "{}", result.reason);
        assert!(!result.reason.contains("timeout"));
    }

    #[test]
    fn below_threshold_errors_do_not_trigger_recovery() {
        let analysis = TranscriptAnalysis {
            repeated_errors: vec![RepeatedError {
                pattern: ErrorPattern::Timeout,
                count: 2,
            }],
            meaningful_changes: true,
            ..TranscriptAnalysis::default()
        };
        let result = decide(Some(&state_at(3)), Some(&analysis));
        assert_eq!(result.strategy, StrategyName::Explore);
    }

    #[test]
    fn stuck_loop_recovers_regardless_of_iteration() {
        let mut state = state_at(2);
        state.stuck_count = STUCK_THRESHOLD;
        let result = decide(Some(&state), Some(&TranscriptAnalysis::default()));
        assert_eq!(result.strategy, StrategyName::Recovery);
        assert!(result.reason.contains("stuck"));

        state.strategy.current = StrategyName::Recovery;
        let again = decide(Some(&state), Some(&TranscriptAnalysis::default()));
        assert_eq!(again.action, StrategyAction::Switch);
    }

    #[test]
    fn reason_carries_progress_clause() {
        let busy = decide(Some(&state_at(4)), Some(&progress()));
        assert!(busy.reason.ends_with("making progress"));

        let idle = decide(Some(&state_at(4)), Some(&TranscriptAnalysis::default()));
        assert!(idle.reason.contains("warning"));
    }

    #[test]
    fn missing_inputs_fall_back_to_explore() {
        let result = decide(None, Some(&progress()));
        assert_eq!(result.strategy, StrategyName::Explore);
        assert!(result.reason.starts_with("fallback:"));

        let result = decide(Some(&state_at(40)), None);
        assert!(result.reason.starts_with("fallback:"));

        let mut state = state_at(40);
        state.session_id.clear();
        let result = decide(Some(&state), Some(&progress()));
        assert_eq!(result.strategy, StrategyName::Explore);
        assert!(result.reason.starts_with("fallback:"));
    }

    #[test]
    fn every_strategy_has_guidance() {
        for name in [
            StrategyName::Explore,
            StrategyName::Focused,
            StrategyName::Cleanup,
            StrategyName::Recovery,
        ] {
            assert!(!guidance_for(name).is_empty());
        }
    }
}
