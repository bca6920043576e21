//! Orchestration for starting, inspecting and cancelling a loop.
//!
//! Exactly one loop may be active per working directory. Starting a loop
//! requires a reachable memory store: the objective is recorded there and every
//! later boundary reads it back.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::state::{LoopOptions, LoopState};
use crate::core::types::{CheckpointMode, Outcome, StrategyName};
use crate::io::config::load_config;
use crate::io::init::{LoopPaths, init_workspace, remove_if_exists};
use crate::io::loop_state::{
    NoActiveLoopError, StateCorruptedError, StateLock, load_loop_state, new_session_id,
    remove_loop_state, write_loop_state,
};
use crate::io::memory::{MemoryClient, MemoryStore};
use crate::io::report::{LoopSummary, write_summary};
use crate::io::signals::{checkpoint_pending, clear_checkpoint};

/// Outcome of `autoloop start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub session_id: String,
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
}

/// Start a new loop in `root` with `prompt` as its mission.
///
/// - Fails when the memory store is unavailable.
/// - Fails when a loop is already active; a corrupted record is discarded.
/// - Clears stale signals and reports left by an earlier loop.
pub fn start_loop(
    root: &Path,
    memory: &dyn MemoryStore,
    prompt: &str,
    options: &LoopOptions,
) -> Result<StartOutcome> {
    if prompt.trim().is_empty() {
        return Err(anyhow!("autoloop start: prompt must not be empty"));
    }
    let client = MemoryClient::new(memory);
    client.require_available()?;

    let paths = init_workspace(root)?;
    let cfg = load_config(&paths.config_path)?;
    let _lock = StateLock::acquire(&paths.lock_path, cfg.lock_timeout())?;

    match load_loop_state(&paths.loop_state_path) {
        Ok(Some(existing)) if existing.active => {
            return Err(anyhow!(
                "a loop is already active (session {}); run `autoloop cancel` first",
                existing.session_id
            ));
        }
        Ok(_) => {}
        Err(err) => {
            let Some(corrupted) = err.downcast_ref::<StateCorruptedError>() else {
                return Err(err);
            };
            warn!(error = %corrupted, "replacing corrupted loop state");
        }
    }

    for stale in [
        &paths.nudge_path,
        &paths.checkpoint_path,
        &paths.cycle_report_path,
        &paths.next_prompt_path,
        &paths.summary_path,
    ] {
        if remove_if_exists(stale)? {
            debug!(path = %stale.display(), "removed stale file");
        }
    }

    let now = Utc::now();
    let state = LoopState::new(new_session_id(now), prompt, options, now);
    write_loop_state(&paths.loop_state_path, &state)?;
    client.record_objective(&state.session_id, prompt);

    info!(
        session_id = %state.session_id,
        max_iterations = state.max_iterations,
        promise = state.completion_promise.is_some(),
        "loop started"
    );
    Ok(StartOutcome {
        session_id: state.session_id,
        max_iterations: state.max_iterations,
        completion_promise: state.completion_promise,
    })
}

/// Outcome of `autoloop cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub session_id: Option<String>,
    pub iteration: u32,
}

/// Cancel the active loop by removing its record.
///
/// An in-flight agent turn is allowed to finish; its boundary then finds no
/// active loop. A corrupted record is removed as well.
pub fn cancel_loop(root: &Path) -> Result<CancelOutcome> {
    let paths = LoopPaths::new(root);
    if !paths.loop_state_path.exists() {
        return Err(anyhow::Error::new(NoActiveLoopError));
    }
    let cfg = load_config(&paths.config_path)?;
    let _lock = StateLock::acquire(&paths.lock_path, cfg.lock_timeout())?;

    let state = match load_loop_state(&paths.loop_state_path) {
        Ok(Some(state)) => Some(state),
        Ok(None) => return Err(anyhow::Error::new(NoActiveLoopError)),
        Err(err) => {
            let Some(corrupted) = err.downcast_ref::<StateCorruptedError>() else {
                return Err(err);
            };
            warn!(error = %corrupted, "cancelling loop with corrupted state");
            None
        }
    };
    remove_loop_state(&paths.loop_state_path)?;
    clear_checkpoint(&paths)?;

    let outcome = CancelOutcome {
        session_id: state.as_ref().map(|s| s.session_id.clone()),
        iteration: state.as_ref().map_or(0, |s| s.iteration),
    };
    write_summary(
        &paths,
        &LoopSummary {
            outcome: Outcome::Cancelled,
            reason: "cancelled by operator".to_string(),
            iterations: outcome.iteration,
            session_id: outcome.session_id.clone(),
            finished_at: Utc::now(),
        },
    )?;
    info!(session_id = ?outcome.session_id, "loop cancelled");
    Ok(outcome)
}

/// Snapshot printed by `autoloop status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub session_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub cycle: u32,
    pub strategy: StrategyName,
    pub stuck_count: u32,
    pub progress_iterations: u32,
    pub checkpoint_mode: CheckpointMode,
    pub checkpoint_pending: bool,
    pub started_at: String,
}

/// Status of the active loop, `None` when there is none.
pub fn loop_status(root: &Path) -> Result<Option<LoopStatus>> {
    let paths = LoopPaths::new(root);
    let Some(state) = load_loop_state(&paths.loop_state_path)? else {
        return Ok(None);
    };
    Ok(Some(LoopStatus {
        session_id: state.session_id,
        iteration: state.iteration,
        max_iterations: state.max_iterations,
        cycle: state.cycle,
        strategy: state.strategy.current,
        stuck_count: state.stuck_count,
        progress_iterations: state.progress_iterations,
        checkpoint_mode: state.checkpoint_mode,
        checkpoint_pending: checkpoint_pending(&paths),
        started_at: state.started_at.to_rfc3339(),
    }))
}

/// Release a checkpoint pause. Returns false when none was pending.
pub fn resume_loop(root: &Path) -> Result<bool> {
    let paths = LoopPaths::new(root);
    let cleared = clear_checkpoint(&paths)?;
    if cleared {
        info!("checkpoint cleared");
    }
    Ok(cleared)
}
