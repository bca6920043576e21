//! Loop state storage: load/validate/repair, atomic save, exclusive lock.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, warn};

use super::init::{remove_if_exists, write_atomic};
use crate::core::state::LoopState;

const LOOP_STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/loop_state.schema.json"
));

/// Counters that must be non-negative integers for the record to be usable.
const COUNTER_FIELDS: [&str; 4] = [
    "iteration",
    "max_iterations",
    "checkpoint_interval",
    "stuck_count",
];

const LOCK_POLL: Duration = Duration::from_millis(50);

/// The persisted loop record is unusable and must be discarded.
#[derive(Debug)]
pub struct StateCorruptedError {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for StateCorruptedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loop state {} is corrupted: {}",
            self.path.display(),
            self.detail
        )
    }
}

impl std::error::Error for StateCorruptedError {}

/// Another boundary holds the loop state lock.
#[derive(Debug)]
pub struct LockTimeoutError {
    pub path: PathBuf,
    pub timeout: Duration,
}

impl fmt::Display for LockTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {:?} waiting for lock {}",
            self.timeout,
            self.path.display()
        )
    }
}

impl std::error::Error for LockTimeoutError {}

/// No loop is active in this working directory.
#[derive(Debug)]
pub struct NoActiveLoopError;

impl fmt::Display for NoActiveLoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no active loop (start one with `autoloop start`)")
    }
}

impl std::error::Error for NoActiveLoopError {}

/// Generate a fresh session identifier.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    format!(
        "session-{}-{:08x}",
        now.format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}

/// Load loop state from disk. `Ok(None)` when no loop record exists.
///
/// A missing or empty `session_id` is regenerated and written back; every
/// other defect yields [`StateCorruptedError`].
pub fn load_loop_state(path: &Path) -> Result<Option<LoopState>> {
    if !path.exists() {
        debug!(path = %path.display(), "no loop state");
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read loop state {}", path.display()))?;
    let corrupted = |detail: String| {
        anyhow::Error::new(StateCorruptedError {
            path: path.to_path_buf(),
            detail,
        })
    };

    let mut value: Value =
        serde_json::from_str(&contents).map_err(|err| corrupted(format!("invalid json: {err}")))?;
    let repaired = repair_record(&mut value).map_err(corrupted)?;
    validate_schema(&value).map_err(corrupted)?;
    let state: LoopState = serde_json::from_value(value)
        .map_err(|err| corrupted(format!("deserialize: {err}")))?;

    if repaired {
        warn!(
            path = %path.display(),
            session_id = %state.session_id,
            "loop state had no session id; regenerated"
        );
        write_loop_state(path, &state)?;
    }
    debug!(
        session_id = %state.session_id,
        iteration = state.iteration,
        strategy = %state.strategy.current,
        "loop state loaded"
    );
    Ok(Some(state))
}

/// Check counters and regenerate a missing session id. Returns whether the
/// record was changed.
fn repair_record(value: &mut Value) -> std::result::Result<bool, String> {
    let record = value
        .as_object_mut()
        .ok_or_else(|| "record is not a JSON object".to_string())?;

    for field in COUNTER_FIELDS {
        match record.get(field) {
            Some(v) if v.as_u64().is_some_and(|n| u32::try_from(n).is_ok()) => {}
            Some(v) => return Err(format!("{field} must be a non-negative integer, got {v}")),
            None => return Err(format!("missing counter {field}")),
        }
    }

    let has_session = record
        .get("session_id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.trim().is_empty());
    if has_session {
        return Ok(false);
    }
    record.insert(
        "session_id".to_string(),
        Value::String(new_session_id(Utc::now())),
    );
    Ok(true)
}

fn validate_schema(value: &Value) -> std::result::Result<(), String> {
    let schema: Value = serde_json::from_str(LOOP_STATE_SCHEMA)
        .map_err(|err| format!("embedded schema: {err}"))?;
    let compiled = validator_for(&schema).map_err(|err| format!("invalid schema: {err}"))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(format!("schema validation failed: {}", messages.join("; ")));
    }
    Ok(())
}

/// Atomically write loop state to disk (temp file + rename).
pub fn write_loop_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(
        path = %path.display(),
        session_id = %state.session_id,
        iteration = state.iteration,
        "writing loop state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Delete the loop record. Returns whether a record existed.
pub fn remove_loop_state(path: &Path) -> Result<bool> {
    let removed = remove_if_exists(path)?;
    debug!(path = %path.display(), removed, "loop state removed");
    Ok(removed)
}

/// Exclusive advisory lock on the loop state sidecar file.
///
/// Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Poll for the lock until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let deadline = Instant::now() + timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    debug!(path = %path.display(), "loop state lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if is_contended(&err) => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(anyhow::Error::new(LockTimeoutError {
                    path: path.to_path_buf(),
                    timeout,
                }));
            }
            thread::sleep(LOCK_POLL.min(deadline - now));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release loop state lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
