//! Stable exit codes for autoloop CLI commands.

/// Command succeeded, or the loop reached a non-error terminal outcome.
pub const OK: i32 = 0;
/// Command failed: missing precondition, corrupted state, exhausted retries.
pub const ERROR: i32 = 1;
/// `autoloop run` ended its cycle at the context threshold; a handoff is due.
pub const CONTEXT_THRESHOLD: i32 = 100;
