//! Deterministic, pure logic shared by the autoloop orchestration.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod analyzer;
pub mod budget;
pub mod cycle;
pub mod promise;
pub mod state;
pub mod strategy;
pub mod transcript;
pub mod types;
