//! Tool contract, registry, and the eight phase tools.
//!
//! A tool declares the [`StateKey`]s it reads and writes and does its work in
//! [`Tool::execute`]. It never mutates [`WorkflowState`]; it returns
//! [`StateUpdate`]s that the loop driver applies. The [`Registry`] resolves
//! tools by name, reports missing inputs before dispatch, and turns tool
//! errors into `failure` results so the loop never aborts on one.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::memory::RunMemory;
use crate::core::state::{StateKey, StateUpdate, WorkflowState};

pub mod ci_fetch;
pub mod ci_wait;
pub mod classifier;
pub mod commit;
pub mod patcher;
pub mod planner;
pub mod test_runner;
pub mod verification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Failure,
    Skipped,
}

/// What a tool hands back to the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    pub summary: String,
    pub outputs: Vec<StateUpdate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ToolResult {
    pub fn new(tool_name: &str, status: ToolStatus, summary: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            status,
            summary: summary.into(),
            outputs: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<StateUpdate>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }
}

/// Per-invocation facts owned by the loop driver.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub iteration: u32,
    pub max_iterations: u32,
    pub memory: &'a RunMemory,
    /// Set when CI monitoring gave up this iteration.
    pub ci_unavailable: bool,
}

pub trait Tool {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn inputs(&self) -> &'static [StateKey];
    fn outputs(&self) -> &'static [StateKey];
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult>;
}

/// Listing entry returned by [`Registry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub inputs: Vec<StateKey>,
    pub outputs: Vec<StateKey>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
    #[error("unknown tool '{name}' (available: {})", available.join(", "))]
    Unknown {
        name: String,
        available: Vec<String>,
    },
}

/// Ordered name → tool map.
#[derive(Default)]
pub struct Registry<'a> {
    tools: Vec<Box<dyn Tool + 'a>>,
}

impl<'a> Registry<'a> {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool + 'a>) -> Result<(), RegistryError> {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            return Err(RegistryError::Duplicate(tool.name().to_string()));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Tool, RegistryError> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref() as &dyn Tool)
            .ok_or_else(|| RegistryError::Unknown {
                name: name.to_string(),
                available: self.tools.iter().map(|t| t.name().to_string()).collect(),
            })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                inputs: t.inputs().to_vec(),
                outputs: t.outputs().to_vec(),
            })
            .collect()
    }

    /// Declared inputs of `name` absent from `state`.
    pub fn missing_inputs(
        &self,
        name: &str,
        state: &WorkflowState,
    ) -> Result<Vec<StateKey>, RegistryError> {
        Ok(state.missing(self.get(name)?.inputs()))
    }

    /// Run a tool. The caller checks [`Registry::missing_inputs`] first.
    ///
    /// An `Err` from the tool becomes a `failure` result carrying the error
    /// chain; outputs for undeclared keys are dropped.
    pub fn invoke(
        &self,
        name: &str,
        state: &WorkflowState,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolResult, RegistryError> {
        let tool = self.get(name)?;
        let mut result = match tool.execute(state, ctx) {
            Ok(result) => result,
            Err(err) => {
                let chain = format!("{err:#}");
                warn!(tool = name, err = %chain, "tool failed");
                let summary = format!("{name} failed: {chain}");
                let failure = ToolResult::new(name, ToolStatus::Failure, summary);
                return Ok(failure.with_error(chain));
            }
        };
        let declared: BTreeSet<StateKey> = tool.outputs().iter().copied().collect();
        result.outputs.retain(|update| {
            let keep = declared.contains(&update.key());
            if !keep {
                warn!(tool = name, key = %update.key(), "dropping undeclared output");
            }
            keep
        });
        let outputs = result.outputs.len();
        debug!(tool = name, status = ?result.status, outputs, "tool finished");
        Ok(result)
    }
}
