//! Operator signals exchanged through files in `.autoloop/state/`.
//!
//! A nudge is a one-time instruction consumed by the next boundary. A
//! checkpoint file blocks the loop until `autoloop resume` removes it or the
//! loop is cancelled.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::init::{LoopPaths, remove_if_exists, write_atomic};

pub fn write_nudge(paths: &LoopPaths, text: &str) -> Result<()> {
    write_atomic(&paths.nudge_path, text)?;
    info!(bytes = text.len(), "nudge queued");
    Ok(())
}

/// Read and delete the pending nudge. Blank nudges are discarded.
pub fn take_nudge(paths: &LoopPaths) -> Result<Option<String>> {
    let text = match fs::read_to_string(&paths.nudge_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", paths.nudge_path.display()));
        }
    };
    remove_if_exists(&paths.nudge_path)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    debug!("nudge consumed");
    Ok(Some(text.to_string()))
}

/// Marker for a pending checkpoint pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    /// Iteration about to start when the pause was requested.
    pub iteration: u32,
    pub requested_at: DateTime<Utc>,
}

pub fn write_checkpoint(paths: &LoopPaths, checkpoint: &Checkpoint) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(checkpoint)?;
    buf.push('\n');
    write_atomic(&paths.checkpoint_path, &buf)
}

pub fn checkpoint_pending(paths: &LoopPaths) -> bool {
    paths.checkpoint_path.exists()
}

pub fn clear_checkpoint(paths: &LoopPaths) -> Result<bool> {
    remove_if_exists(&paths.checkpoint_path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSignal {
    Resumed,
    Cancelled,
}

/// Block until the checkpoint is cleared or the loop state disappears.
pub fn wait_for_resume(
    paths: &LoopPaths,
    poll: Duration,
    sleep: &mut dyn FnMut(Duration),
) -> ResumeSignal {
    info!("checkpoint pause; waiting for `autoloop resume`");
    loop {
        if !paths.loop_state_path.exists() {
            info!("loop cancelled during checkpoint");
            return ResumeSignal::Cancelled;
        }
        if !checkpoint_pending(paths) {
            info!("checkpoint resumed");
            return ResumeSignal::Resumed;
        }
        sleep(poll);
    }
}
