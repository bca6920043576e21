//! Autoloop configuration stored under `.autoloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::init::write_atomic;
use crate::core::cycle::RetryPolicy;

/// Autoloop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoloopConfig {
    /// Model context window in tokens.
    pub context_window_tokens: u64,

    /// Percent of the context window at which a cycle hands off.
    pub context_threshold_pct: u8,

    /// Maximum supervisor cycles per session (0 = unbounded).
    pub max_cycles: u32,

    /// Retries per cycle after a failed cycle process.
    pub max_retries: u32,

    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,

    /// Loop state lock acquisition timeout.
    pub lock_timeout_secs: u64,

    /// Wall-clock budget of one agent invocation.
    pub iteration_timeout_secs: u64,

    /// Wall-clock budget of one supervised cycle process.
    pub cycle_timeout_secs: u64,

    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Poll interval while a checkpoint pause is pending.
    pub checkpoint_poll_secs: u64,

    /// Minimum relevance for cross-session learnings in the prompt.
    pub min_learning_relevance: f64,

    /// Soft size budget for the injected prompt.
    pub prompt_budget_bytes: usize,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Flag used to continue the agent session within a cycle.
    pub resume_flag: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            resume_flag: Some("--resume".to_string()),
        }
    }
}

impl Default for AutoloopConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 200_000,
            context_threshold_pct: 60,
            max_cycles: 10,
            max_retries: 3,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            lock_timeout_secs: 5,
            iteration_timeout_secs: 30 * 60,
            cycle_timeout_secs: 6 * 60 * 60,
            output_limit_bytes: 100_000,
            checkpoint_poll_secs: 2,
            min_learning_relevance: 0.3,
            prompt_budget_bytes: 24_000,
            agent: AgentConfig::default(),
        }
    }
}

impl AutoloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.context_window_tokens == 0 {
            return Err(anyhow!("context_window_tokens must be > 0"));
        }
        if !(1..=100).contains(&self.context_threshold_pct) {
            return Err(anyhow!("context_threshold_pct must be within 1..=100"));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(anyhow!("backoff_cap_secs must be >= backoff_base_secs"));
        }
        if self.lock_timeout_secs == 0 {
            return Err(anyhow!("lock_timeout_secs must be > 0"));
        }
        if self.iteration_timeout_secs == 0 || self.cycle_timeout_secs == 0 {
            return Err(anyhow!(
                "iteration_timeout_secs and cycle_timeout_secs must be > 0"
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.min_learning_relevance) {
            return Err(anyhow!("min_learning_relevance must be within 0.0..=1.0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_secs(self.backoff_base_secs),
            cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn checkpoint_poll(&self) -> Duration {
        Duration::from_secs(self.checkpoint_poll_secs.max(1))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutoloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutoloopConfig> {
    if !path.exists() {
        let cfg = AutoloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutoloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutoloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
