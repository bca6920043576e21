//! I/O helpers for autoloop commands.

pub mod config;
pub mod executor;
pub mod handoff;
pub mod init;
pub mod iteration_log;
pub mod loop_state;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod report;
pub mod signals;
