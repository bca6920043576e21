//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the analyzer, the strategy
//! engine and the boundary orchestration. They must not depend on I/O.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Behavioral phase guiding the next iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyName {
    #[default]
    Explore,
    Focused,
    Cleanup,
    Recovery,
}

impl StrategyName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyName::Explore => "explore",
            StrategyName::Focused => "focused",
            StrategyName::Cleanup => "cleanup",
            StrategyName::Recovery => "recovery",
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the strategy engine kept or changed the current strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyAction {
    Continue,
    Switch,
}

/// Output of the strategy engine. Only `strategy` is folded back into loop state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy: StrategyName,
    pub reason: String,
    pub action: StrategyAction,
    pub guidance: Vec<String>,
}

/// How a due checkpoint is surfaced to the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Block the loop until an external resume signal.
    Pause,
    /// Only annotate the next context with a checkpoint marker.
    #[default]
    Notify,
}

/// Closed set of error patterns recognised in agent output.
///
/// Declaration order is the matching order and the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    CompilationError,
    SyntaxError,
    TestFailure,
    Timeout,
    MissingFile,
    UnresolvedModule,
    TypeError,
    PermissionDenied,
}

impl ErrorPattern {
    pub const ALL: [ErrorPattern; 8] = [
        ErrorPattern::CompilationError,
        ErrorPattern::SyntaxError,
        ErrorPattern::TestFailure,
        ErrorPattern::Timeout,
        ErrorPattern::MissingFile,
        ErrorPattern::UnresolvedModule,
        ErrorPattern::TypeError,
        ErrorPattern::PermissionDenied,
    ];

    /// Human-readable label used in reasons, prompts and memory entries.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorPattern::CompilationError => "compilation error",
            ErrorPattern::SyntaxError => "syntax error",
            ErrorPattern::TestFailure => "test failure",
            ErrorPattern::Timeout => "timeout",
            ErrorPattern::MissingFile => "missing file",
            ErrorPattern::UnresolvedModule => "unresolved module",
            ErrorPattern::TypeError => "type error",
            ErrorPattern::PermissionDenied => "permission denied",
        }
    }
}

impl fmt::Display for ErrorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single error match with a truncated sample of the offending line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMatch {
    pub pattern: ErrorPattern,
    pub sample: String,
}

/// An error pattern that occurred more than once in one transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatedError {
    pub pattern: ErrorPattern,
    pub count: u32,
}

/// Completion phrase recognised in assistant text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTag {
    Phase(u32),
    TestsPassing,
    ImplementationComplete,
    SetupDone,
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTag::Phase(n) => write!(f, "phase {n} complete"),
            PhaseTag::TestsPassing => f.write_str("tests passing"),
            PhaseTag::ImplementationComplete => f.write_str("implementation complete"),
            PhaseTag::SetupDone => f.write_str("setup done"),
        }
    }
}

/// Structured signal extracted from one iteration's transcript.
///
/// Recomputed every iteration and never persisted beyond the iteration log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptAnalysis {
    pub errors: Vec<ErrorMatch>,
    /// Patterns seen at least twice, count descending, discovery order on ties.
    pub repeated_errors: Vec<RepeatedError>,
    pub files_modified: BTreeSet<String>,
    pub tests_run: bool,
    pub tests_passed: bool,
    pub tests_failed: bool,
    pub phase_completions: BTreeSet<PhaseTag>,
    pub meaningful_changes: bool,
    /// `LEARNING:` lines in assistant text, in transcript order.
    pub learnings: Vec<String>,
    /// `NEXT:` lines in assistant text, in transcript order.
    pub next_actions: Vec<String>,
    /// Total characters of assistant-authored text.
    pub assistant_chars: usize,
}

/// Final outcome category written to the human-readable summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The completion promise was emitted.
    Completed,
    /// Stopped at a limit after making some progress.
    Partial,
    /// Stopped at a limit without any meaningful progress.
    Incomplete,
    Cancelled,
    Error,
    /// Ended the cycle for a context-budget handoff.
    Cycling,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Partial => "partial",
            Outcome::Incomplete => "incomplete",
            Outcome::Cancelled => "cancelled",
            Outcome::Error => "error",
            Outcome::Cycling => "cycling",
        }
    }

    /// Outcome for a loop that hit a limit (iterations or cycles).
    pub fn at_limit(progress_iterations: u32) -> Self {
        if progress_iterations > 0 {
            Outcome::Partial
        } else {
            Outcome::Incomplete
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
