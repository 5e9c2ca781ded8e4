//! Side-effecting adapters: config, processes, git, sandboxes, CI, and models.

pub mod config;
pub mod discovery;
pub mod git;
pub mod github;
pub mod iteration_log;
pub mod llm;
pub mod process;
pub mod retry;
pub mod sandbox;
pub mod static_analysis;
