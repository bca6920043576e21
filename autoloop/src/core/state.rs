//! Loop state record and its pure transitions.
//!
//! The record is persisted by `io::loop_state`; everything here is
//! deterministic so the boundary can be tested without touching disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{CheckpointMode, StrategyName, StrategyResult, TranscriptAnalysis};

/// Strategy currently applied and the iteration at which it was adopted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyState {
    pub current: StrategyName,
    pub changed_at_iteration: u32,
}

/// Persisted loop record (`.autoloop/state/loop_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub active: bool,
    /// Completed iterations, cumulative across cycles.
    pub iteration: u32,
    /// Iteration cap; 0 means unbounded.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Correlation key into the memory store. Never changes for a loop.
    pub session_id: String,
    /// Mission text the loop was started with.
    pub prompt: String,
    /// Checkpoint cadence; 0 disables checkpoints.
    pub checkpoint_interval: u32,
    pub checkpoint_mode: CheckpointMode,
    pub strategy: StrategyState,
    /// Consecutive iterations without meaningful changes.
    pub stuck_count: u32,
    /// Iterations that showed meaningful changes.
    #[serde(default)]
    pub progress_iterations: u32,
    /// Current supervisor cycle (1 when unsupervised).
    #[serde(default = "first_cycle")]
    pub cycle: u32,
}

fn first_cycle() -> u32 {
    1
}

/// Parameters accepted when a loop is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub checkpoint_interval: u32,
    pub checkpoint_mode: CheckpointMode,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            completion_promise: None,
            checkpoint_interval: 0,
            checkpoint_mode: CheckpointMode::Notify,
        }
    }
}

impl LoopState {
    pub fn new(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        options: &LoopOptions,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            active: true,
            iteration: 0,
            max_iterations: options.max_iterations,
            completion_promise: options
                .completion_promise
                .as_ref()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            started_at,
            session_id: session_id.into(),
            prompt: prompt.into(),
            checkpoint_interval: options.checkpoint_interval,
            checkpoint_mode: options.checkpoint_mode,
            strategy: StrategyState::default(),
            stuck_count: 0,
            progress_iterations: 0,
            cycle: 1,
        }
    }

    /// Fold one completed iteration into the counters.
    pub fn record_iteration(&mut self, analysis: &TranscriptAnalysis) {
        self.iteration = self.iteration.saturating_add(1);
        if analysis.meaningful_changes {
            self.stuck_count = 0;
            self.progress_iterations = self.progress_iterations.saturating_add(1);
        } else {
            self.stuck_count = self.stuck_count.saturating_add(1);
        }
    }

    /// Adopt the engine's strategy, stamping the change iteration on a switch.
    pub fn apply_strategy(&mut self, result: &StrategyResult) {
        if self.strategy.current != result.strategy {
            self.strategy = StrategyState {
                current: result.strategy,
                changed_at_iteration: self.iteration,
            };
        }
    }

    pub fn cap_reached(&self) -> bool {
        self.max_iterations > 0 && self.iteration >= self.max_iterations
    }

    /// True when the upcoming iteration lands on a checkpoint.
    pub fn checkpoint_due(&self) -> bool {
        self.checkpoint_interval > 0 && (self.iteration + 1) % self.checkpoint_interval == 0
    }

    /// Number of the iteration the next prompt is built for.
    pub fn next_iteration(&self) -> u32 {
        self.iteration + 1
    }
}
