//! `fix_planner`: decide a strategy per bug without touching any file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::patch::{SourceText, numbered, window};
use crate::core::path::{basename, is_test_file};
use crate::core::plan::{
    CONTEXT_RADIUS, choose_strategy, dedupe_locations, escalate_if_retried, skip_test_entry,
    unresolvable_entry,
};
use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::core::types::{Category, ClassifiedBug, FixPlanEntry, Strategy};
use crate::io::discovery::repo_files;
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

pub struct PlannerTool;

/// Find `reported` under `repo`: the exact relative path, else the first
/// file with the same name in sorted order.
pub fn resolve_target(repo: &Path, reported: &str) -> Result<Option<PathBuf>> {
    let direct = repo.join(reported);
    if direct.is_file() {
        return Ok(Some(direct));
    }
    let name = basename(reported);
    if name.is_empty() {
        return Ok(None);
    }
    let mut candidates: Vec<PathBuf> = repo_files(repo)?
        .into_iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()) == Some(name))
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

fn plan_one(bug: &ClassifiedBug, repo: &Path) -> Result<FixPlanEntry> {
    if is_test_file(&bug.bug.file) {
        info!(file = %bug.bug.file, "skipping test file");
        return Ok(skip_test_entry(bug));
    }
    let Some(target) = resolve_target(repo, &bug.bug.file)? else {
        warn!(file = %bug.bug.file, "file not found");
        let reason = format!("File not found: {}", bug.bug.file);
        return Ok(unresolvable_entry(bug, reason));
    };
    let text = match fs::read_to_string(&target) {
        Ok(text) => text,
        Err(err) => {
            let reason = format!("Cannot read file: {err}");
            return Ok(unresolvable_entry(bug, reason));
        }
    };
    let source = SourceText::parse(&text);
    let line = bug.bug.line as usize;
    let (start, end) = window(line, source.lines.len(), CONTEXT_RADIUS, CONTEXT_RADIUS);
    let (strategy, description) = choose_strategy(&bug.bug, &source.lines);
    Ok(FixPlanEntry {
        bug: bug.bug.clone(),
        strategy,
        target_file: Some(target),
        source_context: numbered(&source.lines[start..end], start + 1),
        description,
        fix_hint: bug.fix_hint.clone(),
    })
}

impl Tool for PlannerTool {
    fn name(&self) -> &'static str {
        "fix_planner"
    }

    fn description(&self) -> &'static str {
        "Chooses a deterministic rule or the model for each classified bug. Edits nothing."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::ClassifiedBugs, StateKey::RepoPath]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[StateKey::FixPlan]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let name = self.name();
        let bugs = state.classified_bugs.as_deref().unwrap_or_default();
        let Some(repo) = state.repo_path.as_deref() else {
            return Ok(ToolResult::new(name, ToolStatus::Skipped, "No repository path."));
        };
        if bugs.is_empty() {
            let empty = vec![StateUpdate::FixPlan(Vec::new())];
            return Ok(ToolResult::new(name, ToolStatus::Skipped, "No bugs to plan.")
                .with_outputs(empty));
        }

        let prior: BTreeSet<(String, Category)> = ctx.memory.fixed_signatures();
        let mut plan = Vec::new();
        for bug in dedupe_locations(bugs) {
            let mut entry = match plan_one(bug, repo) {
                Ok(entry) => entry,
                Err(err) => {
                    let chain = format!("{err:#}");
                    warn!(file = %bug.bug.file, err = %chain, "could not locate file");
                    unresolvable_entry(bug, chain)
                }
            };
            escalate_if_retried(&mut entry, &prior);
            info!(
                file = %entry.bug.file,
                line = entry.bug.line,
                category = %entry.bug.category,
                strategy = %entry.strategy,
                "planned fix"
            );
            plan.push(entry);
        }

        let actionable = plan.iter().filter(|e| e.strategy.is_actionable()).count();
        let skipped = plan
            .iter()
            .filter(|e| e.strategy == Strategy::SkipTestFile)
            .count();
        let status = if actionable > 0 {
            ToolStatus::Success
        } else {
            ToolStatus::Failure
        };
        let summary = format!(
            "Planned {actionable}/{} fix(es), skipped {skipped} (test file protection).",
            bugs.len()
        );
        Ok(ToolResult::new(name, status, summary).with_outputs(vec![StateUpdate::FixPlan(plan)]))
    }
}
