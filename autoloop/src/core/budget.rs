//! Shared time and context budget helpers for deterministic orchestration.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Bytes per token used when the agent reports no usage.
pub const BYTES_PER_TOKEN: u64 = 4;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("cycle timed out"));
    }
    Ok(remaining)
}

/// Context consumed by the current cycle's agent session.
///
/// `tokens` holds the latest exact count reported by the agent; `bytes`
/// accumulates transcript size for the heuristic fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextUsage {
    pub tokens: Option<u64>,
    pub bytes: u64,
}

impl ContextUsage {
    /// Fold one iteration into the running usage.
    pub fn observe(&mut self, reported_tokens: Option<u64>, transcript_bytes: u64) {
        self.bytes = self.bytes.saturating_add(transcript_bytes);
        if let Some(tokens) = reported_tokens {
            self.tokens = Some(tokens);
        }
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.tokens.unwrap_or(self.bytes / BYTES_PER_TOKEN)
    }

    /// Percent of `window_tokens` consumed. A zero window counts as full.
    pub fn percent_of(&self, window_tokens: u64) -> f64 {
        if window_tokens == 0 {
            return 100.0;
        }
        self.estimated_tokens() as f64 * 100.0 / window_tokens as f64
    }

    pub fn threshold_crossed(&self, window_tokens: u64, threshold_pct: u8) -> bool {
        self.percent_of(window_tokens) >= f64::from(threshold_pct)
    }
}
