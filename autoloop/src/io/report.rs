//! Human-readable loop summary and the per-cycle report read by the supervisor.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::init::{LoopPaths, write_atomic};
use crate::core::types::Outcome;

/// Final record of a loop, rendered to `.autoloop/summary.md`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub outcome: Outcome,
    pub reason: String,
    pub iterations: u32,
    pub session_id: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl LoopSummary {
    pub fn render(&self) -> String {
        let mut out = String::from("# Autoloop summary\n\n");
        out.push_str(&format!("- Outcome: {}\n", self.outcome));
        out.push_str(&format!("- Reason: {}\n", self.reason));
        out.push_str(&format!("- Iterations: {}\n", self.iterations));
        if let Some(session) = &self.session_id {
            out.push_str(&format!("- Session: {session}\n"));
        }
        out.push_str(&format!(
            "- Finished: {}\n",
            self.finished_at.format("%Y-%m-%dT%H:%M:%SZ")
        ));
        out
    }
}

/// Write the summary and echo it to stderr. Returns the rendered text.
pub fn write_summary(paths: &LoopPaths, summary: &LoopSummary) -> Result<String> {
    let text = summary.render();
    write_atomic(&paths.summary_path, &text)?;
    info!(
        outcome = %summary.outcome,
        iterations = summary.iterations,
        "loop summary written"
    );
    eprint!("{text}");
    Ok(text)
}

/// What a finished cycle process leaves for its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub session_id: String,
    pub cycle: u32,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub reason: String,
    /// Cumulative iteration count when the cycle ended.
    pub iterations: u32,
    pub context_pct: f64,
    pub finished_at: DateTime<Utc>,
}

pub fn write_cycle_report(path: &Path, report: &CycleReport) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(report)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn read_cycle_report(path: &Path) -> Result<Option<CycleReport>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let report =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(report))
}
