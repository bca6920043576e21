//! Single-cycle driver for `autoloop run`.
//!
//! One cycle is one agent session: iterations run back to back, each followed
//! by a boundary, until the loop terminates or the session's context usage
//! crosses the handoff threshold.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::boundary::{BoundaryConfig, BoundaryDecision, process_transcript};
use crate::core::budget::ContextUsage;
use crate::core::transcript::Usage;
use crate::core::types::Outcome;
use crate::exit_codes;
use crate::io::config::AutoloopConfig;
use crate::io::executor::{Agent, AgentRequest, invoke_and_read};
use crate::io::handoff::load_handoff;
use crate::io::init::LoopPaths;
use crate::io::loop_state::{NoActiveLoopError, load_loop_state};
use crate::io::memory::{MemoryClient, MemoryStore};
use crate::io::report::{CycleReport, LoopSummary, write_cycle_report, write_summary};

/// Configuration for one cycle.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub context_window_tokens: u64,
    pub context_threshold_pct: u8,
    pub iteration_timeout: Duration,
    pub output_limit_bytes: usize,
    pub boundary: BoundaryConfig,
}

impl CycleConfig {
    pub fn from_config(cfg: &AutoloopConfig) -> Self {
        Self {
            context_window_tokens: cfg.context_window_tokens,
            context_threshold_pct: cfg.context_threshold_pct,
            iteration_timeout: cfg.iteration_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            boundary: BoundaryConfig::from_config(cfg),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self::from_config(&AutoloopConfig::default())
    }
}

/// Reason why `run_cycle` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleStop {
    /// The loop reached a terminal outcome; its state record is gone.
    Terminated { outcome: Outcome, reason: String },
    /// Context usage crossed the threshold; the loop continues in a new cycle.
    ContextThreshold,
}

/// Summary of a cycle invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub session_id: String,
    pub cycle: u32,
    pub iterations_run: u32,
    /// Cumulative iteration count when the cycle stopped.
    pub final_iteration: u32,
    pub context_pct: f64,
    pub stop: CycleStop,
}

impl CycleOutcome {
    /// Process exit code reported to the supervisor.
    pub fn exit_code(&self) -> i32 {
        match &self.stop {
            CycleStop::ContextThreshold => exit_codes::CONTEXT_THRESHOLD,
            CycleStop::Terminated {
                outcome: Outcome::Error,
                ..
            } => exit_codes::ERROR,
            CycleStop::Terminated { .. } => exit_codes::OK,
        }
    }
}

/// Run iterations until the loop terminates or the context threshold is crossed.
///
/// The first prompt is the session's latest handoff continuation (when one
/// exists) followed by the objective. Agent failures stop the cycle with an
/// error and leave the loop state in place for a retry.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_cycle<A: Agent + ?Sized, F: FnMut(&BoundaryDecision)>(
    root: &Path,
    agent: &A,
    memory: &dyn MemoryStore,
    config: &CycleConfig,
    sleep: &mut dyn FnMut(Duration),
    mut on_iteration: F,
) -> Result<CycleOutcome> {
    let paths = LoopPaths::new(root);
    let state = load_loop_state(&paths.loop_state_path)?
        .ok_or_else(|| anyhow::Error::new(NoActiveLoopError))?;
    let session_id = state.session_id.clone();
    let cycle = state.cycle;
    let client = MemoryClient::new(memory);

    let mut prompt = first_prompt(&client, &session_id, &state.prompt);
    let mut iteration = state.next_iteration();
    let mut usage = ContextUsage::default();
    let mut resume: Option<String> = None;
    let mut iterations_run = 0u32;
    info!(session_id = %session_id, cycle, iteration, "cycle started");

    loop {
        let iter_dir = paths.iteration_dir(&session_id, iteration);
        let request = AgentRequest {
            workdir: root.to_path_buf(),
            prompt: prompt.clone(),
            transcript_path: iter_dir.join("transcript.jsonl"),
            log_path: iter_dir.join("agent.log"),
            timeout: config.iteration_timeout,
            output_limit_bytes: config.output_limit_bytes,
            resume: resume.clone(),
        };
        let transcript = invoke_and_read(agent, &request)
            .with_context(|| format!("iteration {iteration} agent invocation"))?;
        iterations_run += 1;
        usage.observe(
            transcript.usage.as_ref().map(Usage::context_tokens),
            transcript.bytes as u64,
        );
        if transcript.agent_session_id.is_some() {
            resume = transcript.agent_session_id.clone();
        }

        let decision = process_transcript(root, Ok(transcript), memory, &config.boundary, sleep)?;
        on_iteration(&decision);
        let context_pct = usage.percent_of(config.context_window_tokens);

        match decision {
            BoundaryDecision::Continue {
                prompt: next,
                iteration: next_iteration,
                ..
            } => {
                if usage.threshold_crossed(
                    config.context_window_tokens,
                    config.context_threshold_pct,
                ) {
                    info!(
                        context_pct,
                        threshold_pct = config.context_threshold_pct,
                        "context threshold crossed; handing off"
                    );
                    let reason = format!(
                        "context usage {context_pct:.1}% crossed the {}% threshold",
                        config.context_threshold_pct
                    );
                    write_summary(
                        &paths,
                        &LoopSummary {
                            outcome: Outcome::Cycling,
                            reason: reason.clone(),
                            iterations: next_iteration - 1,
                            session_id: Some(session_id.clone()),
                            finished_at: Utc::now(),
                        },
                    )?;
                    return finish(
                        &paths,
                        CycleOutcome {
                            session_id,
                            cycle,
                            iterations_run,
                            final_iteration: next_iteration - 1,
                            context_pct,
                            stop: CycleStop::ContextThreshold,
                        },
                        Some(Outcome::Cycling),
                        reason,
                    );
                }
                prompt = next;
                iteration = next_iteration;
            }
            BoundaryDecision::Terminate {
                outcome,
                reason,
                iteration: final_iteration,
            } => {
                return finish(
                    &paths,
                    CycleOutcome {
                        session_id,
                        cycle,
                        iterations_run,
                        final_iteration,
                        context_pct,
                        stop: CycleStop::Terminated {
                            outcome,
                            reason: reason.clone(),
                        },
                    },
                    Some(outcome),
                    reason,
                );
            }
            BoundaryDecision::Inactive => {
                let reason = "loop cancelled".to_string();
                return finish(
                    &paths,
                    CycleOutcome {
                        session_id,
                        cycle,
                        iterations_run,
                        final_iteration: iteration,
                        context_pct,
                        stop: CycleStop::Terminated {
                            outcome: Outcome::Cancelled,
                            reason: reason.clone(),
                        },
                    },
                    Some(Outcome::Cancelled),
                    reason,
                );
            }
            BoundaryDecision::Skipped { reason } => {
                warn!(reason = %reason, "boundary skipped inside a cycle");
                return Err(anyhow!("iteration {iteration} boundary skipped: {reason}"));
            }
        }
    }
}

fn first_prompt(memory: &MemoryClient<'_>, session_id: &str, prompt: &str) -> String {
    let objective = memory
        .objective(session_id)
        .unwrap_or_else(|| prompt.to_string());
    match load_handoff(memory, session_id).formatted_context {
        Some(continuation) => {
            info!(session_id, "continuing from handoff");
            format!("{continuation}\n## OBJECTIVE\n{objective}\n")
        }
        None => prompt.to_string(),
    }
}

fn finish(
    paths: &LoopPaths,
    outcome: CycleOutcome,
    loop_outcome: Option<Outcome>,
    reason: String,
) -> Result<CycleOutcome> {
    write_cycle_report(
        &paths.cycle_report_path,
        &CycleReport {
            session_id: outcome.session_id.clone(),
            cycle: outcome.cycle,
            exit_code: outcome.exit_code(),
            outcome: loop_outcome,
            reason,
            iterations: outcome.final_iteration,
            context_pct: outcome.context_pct,
            finished_at: Utc::now(),
        },
    )?;
    info!(
        cycle = outcome.cycle,
        iterations_run = outcome.iterations_run,
        exit_code = outcome.exit_code(),
        "cycle finished"
    );
    Ok(outcome)
}
