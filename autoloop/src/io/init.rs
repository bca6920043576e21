//! Canonical `.autoloop/` layout and workspace scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::{AutoloopConfig, write_config};

/// All canonical paths within `.autoloop/` for a project root.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub autoloop_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub summary_path: PathBuf,
    pub loop_state_path: PathBuf,
    pub lock_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub nudge_path: PathBuf,
    pub cycle_report_path: PathBuf,
    pub next_prompt_path: PathBuf,
    pub memory_path: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let autoloop_dir = root.join(".autoloop");
        let state_dir = autoloop_dir.join("state");
        let memory_dir = autoloop_dir.join("memory");
        Self {
            root: root.clone(),
            autoloop_dir: autoloop_dir.clone(),
            state_dir: state_dir.clone(),
            iterations_dir: autoloop_dir.join("iterations"),
            cycles_dir: autoloop_dir.join("cycles"),
            memory_dir: memory_dir.clone(),
            gitignore_path: autoloop_dir.join(".gitignore"),
            config_path: autoloop_dir.join("config.toml"),
            summary_path: autoloop_dir.join("summary.md"),
            loop_state_path: state_dir.join("loop_state.json"),
            lock_path: state_dir.join("loop_state.lock"),
            checkpoint_path: state_dir.join("checkpoint.json"),
            nudge_path: state_dir.join("nudge.md"),
            cycle_report_path: state_dir.join("cycle_report.json"),
            next_prompt_path: state_dir.join("next_prompt.md"),
            memory_path: memory_dir.join("entries.jsonl"),
        }
    }

    /// Directory holding the artifacts of one iteration.
    pub fn iteration_dir(&self, session_id: &str, iteration: u32) -> PathBuf {
        self.iterations_dir
            .join(session_id)
            .join(iteration.to_string())
    }

    /// Agent output log for one cycle.
    pub fn cycle_log_path(&self, session_id: &str, cycle: u32, attempt: u32) -> PathBuf {
        self.cycles_dir
            .join(session_id)
            .join(format!("cycle-{cycle}-attempt-{attempt}.log"))
    }
}

/// Create `.autoloop/` scaffolding in `root`, keeping anything that exists.
///
/// The memory store is not created here; it has its own explicit init.
pub fn init_workspace(root: &Path) -> Result<LoopPaths> {
    let paths = LoopPaths::new(root);
    if paths.autoloop_dir.exists() && !paths.autoloop_dir.is_dir() {
        return Err(anyhow!(
            "autoloop init: .autoloop exists but is not a directory"
        ));
    }
    debug!(root = %root.display(), "initializing workspace");

    create_dir(&paths.autoloop_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;
    create_dir(&paths.cycles_dir)?;

    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, AUTOLOOP_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    }
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &AutoloopConfig::default())?;
    }
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

/// Write `contents` next to `path` and rename over it.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

const AUTOLOOP_GITIGNORE: &str = "state/\niterations/\ncycles/\nsummary.md\n";
