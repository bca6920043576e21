//! Autonomous iteration supervisor for bounded-context agents.
//!
//! This crate drives an external agent process toward a long-running
//! objective across many invocations. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transcript analysis, strategy,
//!   loop state transitions, the cycle state machine). No I/O, fully testable
//!   in isolation.
//! - **[`io`]**: Side-effecting operations (loop state file and lock, memory
//!   store, prompt rendering, process execution). Isolated to enable fakes in
//!   tests.
//!
//! Orchestration modules ([`boundary`], [`start`], [`looping`], [`supervisor`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod boundary;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
