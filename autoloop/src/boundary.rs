//! Orchestration for one iteration boundary (`autoloop boundary`).
//!
//! Runs after every agent invocation: analyze the transcript, fold it into the
//! loop state, update memory, decide the strategy, and either terminate the
//! loop or emit the prompt for the next iteration. The loop state
//! read-modify-write happens under [`StateLock`]; a contended lock skips the
//! update instead of waiting.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::analyzer::analyze;
use crate::core::promise::promise_fulfilled;
use crate::core::state::LoopState;
use crate::core::strategy::decide;
use crate::core::transcript::Transcript;
use crate::core::types::{
    CheckpointMode, Outcome, StrategyName, StrategyResult, TranscriptAnalysis,
};
use crate::io::config::AutoloopConfig;
use crate::io::executor::read_transcript;
use crate::io::init::{LoopPaths, write_atomic};
use crate::io::iteration_log::{IterationDecision, IterationMeta, write_iteration};
use crate::io::loop_state::{
    LockTimeoutError, StateCorruptedError, StateLock, load_loop_state, remove_loop_state,
    write_loop_state,
};
use crate::io::memory::{MemoryClient, MemoryStore};
use crate::io::prompt::{ContextBuilder, ContextInputs, MAX_LEARNINGS, MemoryContext};
use crate::io::report::{LoopSummary, write_summary};
use crate::io::signals::{
    Checkpoint, ResumeSignal, clear_checkpoint, take_nudge, wait_for_resume, write_checkpoint,
};

/// Knobs for boundary processing, usually derived from [`AutoloopConfig`].
#[derive(Debug, Clone)]
pub struct BoundaryConfig {
    pub lock_timeout: Duration,
    pub prompt_budget_bytes: usize,
    pub min_learning_relevance: f64,
    pub checkpoint_poll: Duration,
}

impl BoundaryConfig {
    pub fn from_config(cfg: &AutoloopConfig) -> Self {
        Self {
            lock_timeout: cfg.lock_timeout(),
            prompt_budget_bytes: cfg.prompt_budget_bytes,
            min_learning_relevance: cfg.min_learning_relevance,
            checkpoint_poll: cfg.checkpoint_poll(),
        }
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self::from_config(&AutoloopConfig::default())
    }
}

/// What the boundary decided.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryDecision {
    /// Run another iteration with `prompt`.
    Continue {
        prompt: String,
        /// Number of the iteration the prompt is for.
        iteration: u32,
        strategy: StrategyName,
        /// True when the loop waited on a checkpoint before continuing.
        paused: bool,
    },
    /// The loop ended; the state record is gone and a summary was written.
    Terminate {
        outcome: Outcome,
        reason: String,
        iteration: u32,
    },
    /// Another boundary holds the lock; nothing was changed.
    Skipped { reason: String },
    /// No active loop in this directory.
    Inactive,
}

impl BoundaryDecision {
    /// JSON contract printed by `autoloop boundary`.
    pub fn to_json(&self) -> Value {
        match self {
            BoundaryDecision::Continue {
                prompt,
                iteration,
                strategy,
                paused,
            } => json!({
                "action": "continue",
                "prompt": prompt,
                "iteration": iteration,
                "strategy": strategy,
                "paused": paused,
            }),
            BoundaryDecision::Terminate {
                outcome,
                reason,
                iteration,
            } => json!({
                "action": "terminate",
                "outcome": outcome,
                "reason": reason,
                "iteration": iteration,
            }),
            BoundaryDecision::Skipped { reason } => json!({
                "action": "skip",
                "reason": reason,
            }),
            BoundaryDecision::Inactive => json!({
                "action": "skip",
                "reason": "no active loop",
            }),
        }
    }
}

/// Process a boundary for the transcript at `transcript_path`.
pub fn process_boundary(
    root: &Path,
    transcript_path: &Path,
    memory: &dyn MemoryStore,
    config: &BoundaryConfig,
    sleep: &mut dyn FnMut(Duration),
) -> Result<BoundaryDecision> {
    let transcript = read_transcript(transcript_path);
    process_transcript(root, transcript, memory, config, sleep)
}

/// Process a boundary for an already-read transcript.
///
/// A transcript read error terminates the loop: no safe decision can be made
/// without it.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn process_transcript(
    root: &Path,
    transcript: Result<Transcript>,
    memory: &dyn MemoryStore,
    config: &BoundaryConfig,
    sleep: &mut dyn FnMut(Duration),
) -> Result<BoundaryDecision> {
    let paths = LoopPaths::new(root);
    if !paths.loop_state_path.exists() {
        debug!("no loop state; nothing to schedule");
        return Ok(BoundaryDecision::Inactive);
    }

    let lock = match StateLock::acquire(&paths.lock_path, config.lock_timeout) {
        Ok(lock) => lock,
        Err(err) => {
            if let Some(timeout) = err.downcast_ref::<LockTimeoutError>() {
                warn!(error = %timeout, "boundary skipped: lock contended");
                return Ok(BoundaryDecision::Skipped {
                    reason: timeout.to_string(),
                });
            }
            return Err(err);
        }
    };

    let mut state = match load_loop_state(&paths.loop_state_path) {
        Ok(Some(state)) => state,
        Ok(None) => return Ok(BoundaryDecision::Inactive),
        Err(err) => {
            let Some(corrupted) = err.downcast_ref::<StateCorruptedError>() else {
                return Err(err);
            };
            warn!(error = %corrupted, "discarding corrupted loop state");
            return terminate(&paths, None, Outcome::Error, corrupted.to_string(), 0);
        }
    };
    if !state.active {
        debug!(session_id = %state.session_id, "loop state inactive");
        return Ok(BoundaryDecision::Inactive);
    }

    let transcript = match transcript {
        Ok(transcript) => transcript,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "transcript unavailable");
            let iteration = state.iteration;
            return terminate(
                &paths,
                Some(&state),
                Outcome::Error,
                format!("transcript unavailable: {err:#}"),
                iteration,
            );
        }
    };

    let analysis = analyze(&transcript);
    state.record_iteration(&analysis);
    info!(
        session_id = %state.session_id,
        iteration = state.iteration,
        meaningful = analysis.meaningful_changes,
        errors = analysis.errors.len(),
        stuck_count = state.stuck_count,
        "iteration analyzed"
    );

    let client = MemoryClient::new(memory);
    record_iteration_memory(&client, &state, &analysis);

    let last_text = transcript.last_assistant_text();
    if promise_fulfilled(last_text.as_deref(), state.completion_promise.as_deref()) {
        let reason = format!(
            "completion promise detected: {}",
            state.completion_promise.as_deref().unwrap_or_default()
        );
        log_terminal(root, &state, &analysis, Outcome::Completed)?;
        let iteration = state.iteration;
        return terminate(&paths, Some(&state), Outcome::Completed, reason, iteration);
    }
    if state.cap_reached() {
        let outcome = Outcome::at_limit(state.progress_iterations);
        let reason = format!("max iterations reached ({})", state.max_iterations);
        log_terminal(root, &state, &analysis, outcome)?;
        let iteration = state.iteration;
        return terminate(&paths, Some(&state), outcome, reason, iteration);
    }

    let strategy = decide(Some(&state), Some(&analysis));
    if state.strategy.current != strategy.strategy {
        info!(
            from = %state.strategy.current,
            to = %strategy.strategy,
            reason = %strategy.reason,
            "strategy switch"
        );
    }
    state.apply_strategy(&strategy);

    let pause_due = state.checkpoint_due() && state.checkpoint_mode == CheckpointMode::Pause;
    let notify_due = state.checkpoint_due() && state.checkpoint_mode == CheckpointMode::Notify;
    write_loop_state(&paths.loop_state_path, &state)?;
    drop(lock);

    let mut paused = false;
    if pause_due {
        write_checkpoint(
            &paths,
            &Checkpoint {
                session_id: state.session_id.clone(),
                iteration: state.next_iteration(),
                requested_at: Utc::now(),
            },
        )?;
        paused = true;
        if wait_for_resume(&paths, config.checkpoint_poll, sleep) == ResumeSignal::Cancelled {
            clear_checkpoint(&paths)?;
            return Ok(BoundaryDecision::Terminate {
                outcome: Outcome::Cancelled,
                reason: "cancelled during checkpoint pause".to_string(),
                iteration: state.iteration,
            });
        }
    }

    let nudge = take_nudge(&paths)?;
    let memory_context = memory_context(&client, &state, config.min_learning_relevance);
    let notice = notify_due.then(|| checkpoint_notice(state.next_iteration()));
    let prompt = ContextBuilder::new(config.prompt_budget_bytes).build(&ContextInputs {
        state: &state,
        strategy: &strategy,
        analysis: &analysis,
        nudge: nudge.as_deref(),
        memory: &memory_context,
        checkpoint_notice: notice.as_deref(),
    })?;

    write_iteration(
        root,
        &iteration_meta(&state, &analysis, IterationDecision::Continue, None, Some(&strategy)),
        Some(&prompt),
    )?;
    write_atomic(&paths.next_prompt_path, &prompt)?;

    Ok(BoundaryDecision::Continue {
        prompt,
        iteration: state.next_iteration(),
        strategy: strategy.strategy,
        paused,
    })
}

/// Remove the loop record, write the summary, and report the termination.
fn terminate(
    paths: &LoopPaths,
    state: Option<&LoopState>,
    outcome: Outcome,
    reason: String,
    iteration: u32,
) -> Result<BoundaryDecision> {
    remove_loop_state(&paths.loop_state_path)?;
    clear_checkpoint(paths)?;
    info!(outcome = %outcome, iteration, reason = %reason, "loop terminated");
    write_summary(
        paths,
        &LoopSummary {
            outcome,
            reason: reason.clone(),
            iterations: iteration,
            session_id: state.map(|s| s.session_id.clone()),
            finished_at: Utc::now(),
        },
    )?;
    Ok(BoundaryDecision::Terminate {
        outcome,
        reason,
        iteration,
    })
}

fn log_terminal(
    root: &Path,
    state: &LoopState,
    analysis: &TranscriptAnalysis,
    outcome: Outcome,
) -> Result<()> {
    write_iteration(
        root,
        &iteration_meta(state, analysis, IterationDecision::Terminate, Some(outcome), None),
        None,
    )?;
    Ok(())
}

fn iteration_meta(
    state: &LoopState,
    analysis: &TranscriptAnalysis,
    decision: IterationDecision,
    outcome: Option<Outcome>,
    strategy: Option<&StrategyResult>,
) -> IterationMeta {
    IterationMeta {
        session_id: state.session_id.clone(),
        iteration: state.iteration,
        cycle: state.cycle,
        recorded_at: Utc::now(),
        decision,
        outcome,
        strategy: strategy.cloned(),
        stuck_count: state.stuck_count,
        analysis: analysis.clone(),
    }
}

/// Persist what this iteration showed. Every write degrades to a warning.
fn record_iteration_memory(
    memory: &MemoryClient<'_>,
    state: &LoopState,
    analysis: &TranscriptAnalysis,
) {
    let session = state.session_id.as_str();
    let iteration = state.iteration;
    memory.record_status(session, iteration, &status_line(state, analysis));

    let mut seen = HashSet::new();
    for error in &analysis.errors {
        if seen.insert(error.pattern) {
            memory.record_failure(session, iteration, error.pattern.label(), &error.sample);
        }
    }
    for learning in &analysis.learnings {
        memory.record_learning(session, iteration, learning);
    }
    memory.record_next_actions(session, iteration, &analysis.next_actions);
    if let Some(summary) = accomplishment_line(iteration, analysis) {
        memory.record_accomplishment(session, iteration, &summary);
    }
}

fn status_line(state: &LoopState, analysis: &TranscriptAnalysis) -> String {
    let mut parts = vec![format!(
        "Iteration {} ({} strategy)",
        state.iteration, state.strategy.current
    )];
    if !analysis.files_modified.is_empty() {
        parts.push(format!("{} file(s) modified", analysis.files_modified.len()));
    }
    if analysis.tests_run {
        let verdict = match (analysis.tests_passed, analysis.tests_failed) {
            (_, true) => "failing",
            (true, false) => "passing",
            (false, false) => "run",
        };
        parts.push(format!("tests {verdict}"));
    }
    if !analysis.repeated_errors.is_empty() {
        let repeated: Vec<String> = analysis
            .repeated_errors
            .iter()
            .map(|r| format!("{} x{}", r.pattern, r.count))
            .collect();
        parts.push(format!("repeated errors: {}", repeated.join(", ")));
    }
    if !analysis.meaningful_changes {
        parts.push(format!(
            "no meaningful changes ({} in a row)",
            state.stuck_count
        ));
    }
    parts.join("; ")
}

fn accomplishment_line(iteration: u32, analysis: &TranscriptAnalysis) -> Option<String> {
    if !analysis.meaningful_changes {
        return None;
    }
    let mut parts = Vec::new();
    if !analysis.files_modified.is_empty() {
        let files: Vec<&str> = analysis.files_modified.iter().map(String::as_str).collect();
        parts.push(format!("modified {}", files.join(", ")));
    }
    if !analysis.phase_completions.is_empty() {
        let phases: Vec<String> = analysis
            .phase_completions
            .iter()
            .map(ToString::to_string)
            .collect();
        parts.push(format!("completed {}", phases.join(", ")));
    }
    if analysis.tests_passed && !analysis.tests_failed {
        parts.push("tests passing".to_string());
    }
    if parts.is_empty() {
        parts.push("made progress".to_string());
    }
    Some(format!("Iteration {iteration}: {}", parts.join("; ")))
}

fn memory_context(
    memory: &MemoryClient<'_>,
    state: &LoopState,
    min_relevance: f64,
) -> MemoryContext {
    let session = state.session_id.as_str();
    let objective = memory.objective(session);
    let query = objective.clone().unwrap_or_else(|| state.prompt.clone());
    MemoryContext {
        status: memory.latest_status(session),
        next_actions: memory.latest_next_actions(session),
        learnings: memory.session_learnings(session),
        shared_learnings: memory.cross_session_learnings(
            session,
            &query,
            min_relevance,
            MAX_LEARNINGS,
        ),
        objective,
    }
}

fn checkpoint_notice(iteration: u32) -> String {
    format!(
        "Checkpoint at iteration {iteration}. Before continuing, write a short progress \
         report for the operator: what is done, what is blocked, what comes next."
    )
}

/// Read the transcript path from a hook payload on stdin (`{"transcript_path": ...}`).
pub fn transcript_path_from_hook(payload: &str) -> Result<String> {
    let value: Value = serde_json::from_str(payload).context("parse hook payload")?;
    value
        .get("transcript_path")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .context("hook payload missing transcript_path")
}
