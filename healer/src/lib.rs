//! Self-healing CI pipeline.
//!
//! A fixed eight-phase reasoning loop runs a repository's tests, classifies
//! the failures, plans and applies minimal patches, commits and pushes them,
//! waits for CI, and verifies the outcome, repeating until the suite is green
//! or a budget runs out. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, planning, patch
//!   rules, phase transitions, run memory, the result document). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, git, sandboxes, CI, models).
//!   Each sits behind a trait so tests can script it.
//! - **[`tools`]**: One tool per phase, dispatched through a registry.
//!
//! [`looping`] drives the phase ring and [`pipeline`] wires everything for the
//! CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
