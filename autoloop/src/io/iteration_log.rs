//! Iteration logging helpers for `.autoloop/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{Outcome, StrategyResult, TranscriptAnalysis};

/// What the boundary decided for the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationDecision {
    Continue,
    Terminate,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub iteration: u32,
    pub cycle: u32,
    pub recorded_at: DateTime<Utc>,
    pub decision: IterationDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyResult>,
    pub stuck_count: u32,
    pub analysis: TranscriptAnalysis,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
}

impl IterationPaths {
    pub fn new(root: &Path, session_id: &str, iteration: u32) -> Self {
        let dir = root
            .join(".autoloop")
            .join("iterations")
            .join(session_id)
            .join(iteration.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
        }
    }
}

/// Write `meta.json` and, when the loop continues, the injected `prompt.md`.
pub fn write_iteration(
    root: &Path,
    meta: &IterationMeta,
    next_prompt: Option<&str>,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(root, &meta.session_id, meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))?;
    if let Some(prompt) = next_prompt {
        fs::write(&paths.prompt_path, prompt)
            .with_context(|| format!("write {}", paths.prompt_path.display()))?;
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StrategyName;

    fn meta(decision: IterationDecision) -> IterationMeta {
        IterationMeta {
            session_id: "session-9".to_string(),
            iteration: 3,
            cycle: 1,
            recorded_at: DateTime::<Utc>::UNIX_EPOCH,
            decision,
            outcome: None,
            strategy: Some(StrategyResult {
                strategy: StrategyName::Explore,
                reason: "r".to_string(),
                action: crate::core::types::StrategyAction::Continue,
                guidance: vec![],
            }),
            stuck_count: 0,
            analysis: TranscriptAnalysis::default(),
        }
    }

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path(), "session-1", 3);
        assert!(paths.dir.ends_with(Path::new(".autoloop/iterations/session-1/3")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
    }

    #[test]
    fn continue_writes_meta_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_iteration(
            temp.path(),
            &meta(IterationDecision::Continue),
            Some("next prompt"),
        )
        .expect("write");
        let meta_json = fs::read_to_string(&paths.meta_path).expect("meta");
        assert!(meta_json.contains("\"decision\": \"continue\""));
        assert!(!meta_json.contains("\"outcome\""));
        assert_eq!(fs::read_to_string(&paths.prompt_path).expect("prompt"), "next prompt");
    }

    #[test]
    fn terminate_writes_meta_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut meta = meta(IterationDecision::Terminate);
        meta.outcome = Some(Outcome::Completed);
        let paths = write_iteration(temp.path(), &meta, None).expect("write");
        assert!(paths.meta_path.is_file());
        assert!(!paths.prompt_path.exists());
        let meta_json = fs::read_to_string(&paths.meta_path).expect("meta");
        assert!(meta_json.contains("\"outcome\": \"completed\""));
    }
}
