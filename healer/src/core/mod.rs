//! Deterministic, pure logic shared by the healer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branch;
pub mod budget;
pub mod ci_logs;
pub mod classify;
pub mod memory;
pub mod patch;
pub mod path;
pub mod phase;
pub mod plan;
pub mod result;
pub mod rules;
pub mod state;
pub mod trace;
pub mod types;
