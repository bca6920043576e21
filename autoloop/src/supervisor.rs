//! Multi-cycle supervisor for `autoloop supervise`.
//!
//! Each cycle runs in a fresh `autoloop run` process so the agent starts with
//! an empty context. Between cycles the only continuity is the handoff record
//! in the memory store. Exit codes drive [`next_transition`]; this module
//! performs the side effects each transition names.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::cycle::{CycleExit, CycleState, RetryPolicy, Transition, next_transition};
use crate::core::types::Outcome;
use crate::exit_codes;
use crate::io::config::AutoloopConfig;
use crate::io::handoff::{collect_handoff, save_handoff};
use crate::io::init::LoopPaths;
use crate::io::loop_state::{
    NoActiveLoopError, StateLock, load_loop_state, remove_loop_state, write_loop_state,
};
use crate::io::memory::{MemoryClient, MemoryStore};
use crate::io::process::run_command;
use crate::io::report::{LoopSummary, read_cycle_report, write_summary};

/// One cycle launch.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub root: PathBuf,
    pub session_id: String,
    pub cycle: u32,
    /// 1 for the first launch of a cycle, +1 per retry.
    pub attempt: u32,
    pub log_path: PathBuf,
}

/// Abstraction over how a cycle is launched.
pub trait CycleRunner {
    /// Run one cycle to completion and report how it ended.
    fn run_cycle(&self, request: &CycleRequest) -> CycleExit;
}

/// Runs each cycle as `<current exe> run` with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct ProcessCycleRunner {
    pub program: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ProcessCycleRunner {
    pub fn current_exe(cfg: &AutoloopConfig) -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("locate autoloop executable")?,
            timeout: cfg.cycle_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }
}

impl CycleRunner for ProcessCycleRunner {
    #[instrument(skip_all, fields(cycle = request.cycle, attempt = request.attempt))]
    fn run_cycle(&self, request: &CycleRequest) -> CycleExit {
        let mut cmd = Command::new(&self.program);
        cmd.arg("run").current_dir(&request.root);
        let output = match run_command(cmd, None, self.timeout, self.output_limit_bytes, None) {
            Ok(output) => output,
            Err(err) => {
                return CycleExit::Failed {
                    code: None,
                    detail: format!("{err:#}"),
                    retryable: true,
                };
            }
        };
        if let Err(err) = write_cycle_log(&request.log_path, &output.render_log("cycle")) {
            warn!(error = %format!("{err:#}"), "failed to write cycle log");
        }
        if output.timed_out {
            return CycleExit::Failed {
                code: None,
                detail: format!("timed out after {:?}", self.timeout),
                retryable: true,
            };
        }
        CycleExit::from_exit_code(output.status.code(), last_line(&output.stderr))
    }
}

fn write_cycle_log(path: &Path, log: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create cycle log dir {}", parent.display()))?;
    }
    fs::write(path, log).with_context(|| format!("write cycle log {}", path.display()))
}

fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Supervisor limits, usually derived from [`AutoloopConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// 0 = unbounded.
    pub max_cycles: u32,
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_config(cfg: &AutoloopConfig) -> Self {
        Self {
            max_cycles: cfg.max_cycles,
            retry: cfg.retry_policy(),
            lock_timeout: cfg.lock_timeout(),
        }
    }
}

/// Summary of a supervised session.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOutcome {
    pub session_id: String,
    pub state: CycleState,
    pub cycles_run: u32,
    pub retries: u32,
    pub handoffs: Vec<String>,
}

impl SupervisorOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.state {
            CycleState::Failed { .. } => exit_codes::ERROR,
            _ => exit_codes::OK,
        }
    }
}

/// Drive cycles for the active loop until a terminal state.
///
/// A failed cycle is retried with backoff while the loop state still exists;
/// once the record is gone the loop has already ended and retrying is moot.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn supervise(
    root: &Path,
    runner: &dyn CycleRunner,
    memory: &dyn MemoryStore,
    config: &SupervisorConfig,
    sleep: &mut dyn FnMut(Duration),
) -> Result<SupervisorOutcome> {
    let paths = LoopPaths::new(root);
    let state = load_loop_state(&paths.loop_state_path)?
        .ok_or_else(|| anyhow::Error::new(NoActiveLoopError))?;
    let client = MemoryClient::new(memory);
    let session_id = state.session_id.clone();
    let mut cycle = state.cycle;
    let mut fsm = CycleState::Running { cycle };
    let mut retries_used = 0u32;
    let mut total_retries = 0u32;
    let mut cycles_run = 0u32;
    let mut handoffs = Vec::new();
    info!(session_id = %session_id, cycle, max_cycles = config.max_cycles, "supervisor started");

    while !fsm.is_terminal() {
        let request = CycleRequest {
            root: root.to_path_buf(),
            session_id: session_id.clone(),
            cycle,
            attempt: retries_used + 1,
            log_path: paths.cycle_log_path(&session_id, cycle, retries_used + 1),
        };
        let mut exit = runner.run_cycle(&request);
        cycles_run += 1;
        if let CycleExit::Failed { retryable, .. } = &mut exit
            && !paths.loop_state_path.exists()
        {
            *retryable = false;
        }
        let transition = next_transition(cycle, config.max_cycles, &exit, retries_used, &config.retry);
        info!(cycle, ?exit, ?transition, "cycle exited");

        match &transition {
            Transition::Complete => {}
            Transition::Handoff { next_cycle } => {
                if let Some(id) = hand_off(&paths, &client, config, Some(*next_cycle))? {
                    handoffs.push(id);
                }
                cycle = *next_cycle;
                retries_used = 0;
            }
            Transition::MaxCyclesReached { last_cycle } => {
                if let Some(id) = hand_off(&paths, &client, config, None)? {
                    handoffs.push(id);
                }
                finish_at_cycle_cap(&paths, config, *last_cycle)?;
            }
            Transition::Retry { attempt, delay } => {
                warn!(cycle, attempt, delay_ms = delay.as_millis() as u64, "retrying cycle");
                sleep(*delay);
                retries_used = *attempt;
                total_retries += 1;
            }
            Transition::Fail { reason } => {
                warn!(reason = %reason, "supervisor giving up");
                if let Some(state) = load_loop_state(&paths.loop_state_path)? {
                    write_summary(
                        &paths,
                        &LoopSummary {
                            outcome: Outcome::Error,
                            reason: reason.clone(),
                            iterations: state.iteration,
                            session_id: Some(session_id.clone()),
                            finished_at: Utc::now(),
                        },
                    )?;
                }
            }
        }
        fsm = transition.next_state(cycle);
    }

    info!(session_id = %session_id, state = ?fsm, cycles_run, "supervisor finished");
    Ok(SupervisorOutcome {
        session_id,
        state: fsm,
        cycles_run,
        retries: total_retries,
        handoffs,
    })
}

/// Save a handoff for the current loop state and advance its cycle counter.
fn hand_off(
    paths: &LoopPaths,
    memory: &MemoryClient<'_>,
    config: &SupervisorConfig,
    next_cycle: Option<u32>,
) -> Result<Option<String>> {
    let _lock = StateLock::acquire(&paths.lock_path, config.lock_timeout)?;
    let Some(mut state) = load_loop_state(&paths.loop_state_path)? else {
        warn!("loop state gone at handoff; nothing to hand off");
        return Ok(None);
    };
    let context_pct = read_cycle_report(&paths.cycle_report_path)?
        .filter(|r| r.session_id == state.session_id && r.cycle == state.cycle)
        .map_or(0.0, |r| r.context_pct);
    let handoff = collect_handoff(memory, &state, context_pct);
    let id = save_handoff(memory, &handoff);
    if let Some(next_cycle) = next_cycle {
        state.cycle = next_cycle;
        write_loop_state(&paths.loop_state_path, &state)?;
    }
    Ok(id)
}

fn finish_at_cycle_cap(paths: &LoopPaths, config: &SupervisorConfig, last_cycle: u32) -> Result<()> {
    let _lock = StateLock::acquire(&paths.lock_path, config.lock_timeout)?;
    let Some(state) = load_loop_state(&paths.loop_state_path)? else {
        return Ok(());
    };
    remove_loop_state(&paths.loop_state_path)?;
    write_summary(
        paths,
        &LoopSummary {
            outcome: Outcome::at_limit(state.progress_iterations),
            reason: format!("max cycles reached ({last_cycle})"),
            iterations: state.iteration,
            session_id: Some(state.session_id),
            finished_at: Utc::now(),
        },
    )?;
    Ok(())
}
