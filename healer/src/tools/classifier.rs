//! `failure_classifier`: turn test output into located, categorized bugs.

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::classify::{classify_patterns, dedupe, merge_findings};
use crate::core::path::normalize_reported_path;
use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::core::trace::reattribute;
use crate::core::types::{BugRecord, ClassifiedBug, Severity};
use crate::io::llm::{ModelClient, classify_residual};
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

pub struct ClassifierTool<'a> {
    model: Option<&'a dyn ModelClient>,
}

impl<'a> ClassifierTool<'a> {
    /// `model` is `None` when no API key is configured; the model layer is skipped.
    pub fn new(model: Option<&'a dyn ModelClient>) -> Self {
        Self { model }
    }
}

/// Pattern layer, optional model layer, re-attribution, and path normalization.
pub fn classify_log(
    log: &str,
    repo_root: Option<&str>,
    model: Option<&dyn ModelClient>,
) -> Vec<BugRecord> {
    let pass = classify_patterns(log);
    let (pattern, residual) = (pass.bugs.len(), pass.residual.len());
    debug!(pattern, residual, "pattern layer done");
    let model_bugs = match model {
        Some(client) => classify_residual(client, &pass.residual),
        None => Vec::new(),
    };
    let merged = merge_findings(pass.bugs, model_bugs);
    let located = reattribute(merged, log)
        .into_iter()
        .map(|mut bug| {
            bug.file = normalize_reported_path(&bug.file, repo_root);
            bug
        })
        .collect();
    dedupe(located)
}

/// Attach severity and hints, then order by (severity, file, line).
pub fn triage(bugs: Vec<BugRecord>) -> Vec<ClassifiedBug> {
    let mut classified: Vec<ClassifiedBug> =
        bugs.into_iter().map(ClassifiedBug::from_bug).collect();
    classified.sort_by(|a, b| {
        (a.severity, &a.bug.file, a.bug.line).cmp(&(b.severity, &b.bug.file, b.bug.line))
    });
    classified
}

fn severity_summary(bugs: &[ClassifiedBug]) -> String {
    let count = |s: Severity| bugs.iter().filter(|b| b.severity == s).count();
    format!(
        "Classified {} bug(s): {} high, {} medium, {} low.",
        bugs.len(),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low)
    )
}

impl Tool for ClassifierTool<'_> {
    fn name(&self) -> &'static str {
        "failure_classifier"
    }

    fn description(&self) -> &'static str {
        "Turns raw test output into located bug records via pattern rules and the model."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::TestOutput]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[StateKey::ClassifiedBugs]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let name = self.name();
        let log = state.test_output_text();
        if log.trim().is_empty() {
            let none = vec![StateUpdate::ClassifiedBugs(Vec::new())];
            return Ok(ToolResult::new(name, ToolStatus::Skipped, "No test output.")
                .with_outputs(none));
        }
        let root = state
            .repo_path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned());
        let bugs = triage(classify_log(log, root.as_deref(), self.model));
        let summary = severity_summary(&bugs);
        info!(bugs = bugs.len(), "classification finished");
        let status = if bugs.is_empty() {
            ToolStatus::Failure
        } else {
            ToolStatus::Success
        };
        let outputs = vec![StateUpdate::ClassifiedBugs(bugs)];
        Ok(ToolResult::new(name, status, summary).with_outputs(outputs))
    }
}
