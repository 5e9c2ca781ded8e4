//! `patch_applier`: execute a fix plan against the working tree.
//!
//! The only phase that writes source files. Entries are grouped by target
//! file and applied bottom-up inside each file so an edit never shifts the
//! line numbers of entries still pending above it. Every candidate edit is
//! measured with [`changed_line_count`] and rejected past the cap, leaving
//! the file byte-identical.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::patch::{
    SourceText, apply_search_replace, changed_line_count, diff_summary, numbered, window,
};
use crate::core::path::{display_path, is_test_file};
use crate::core::rules::apply_rule;
use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::core::types::{
    AppliedPatch, FixPlanEntry, PatchMethod, SkipStatus, SkippedPatch, Strategy,
};
use crate::io::llm::{ModelClient, PatchPrompt, propose_patch};
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

/// Lines above and below the reported line shown to the model.
const MODEL_WINDOW_BEFORE: usize = 3;
const MODEL_WINDOW_AFTER: usize = 3;

pub struct PatcherTool<'a> {
    model: Option<&'a dyn ModelClient>,
    max_changed_lines: usize,
}

impl<'a> PatcherTool<'a> {
    pub fn new(model: Option<&'a dyn ModelClient>, max_changed_lines: usize) -> Self {
        Self {
            model,
            max_changed_lines,
        }
    }

    fn skipped(entry: &FixPlanEntry, status: SkipStatus, reason: impl Into<String>) -> Outcome {
        Outcome::Skipped(SkippedPatch {
            bug: entry.bug.clone(),
            status,
            reason: reason.into(),
        })
    }

    fn model_fix(
        &self,
        entry: &FixPlanEntry,
        lines: &[String],
        file_name: &str,
    ) -> Option<(Vec<String>, String)> {
        let client = self.model?;
        let bug = &entry.bug;
        let line = bug.line as usize;
        let (start, end) = window(line, lines.len(), MODEL_WINDOW_BEFORE, MODEL_WINDOW_AFTER);
        let snippet = numbered(&lines[start..end], start + 1);
        let block = propose_patch(
            client,
            &PatchPrompt {
                file_name,
                category: bug.category,
                message: &bug.message,
                fix_hint: &entry.fix_hint,
                start_line: start + 1,
                end_line: end,
                snippet: &snippet,
            },
        )?;
        let fixed = apply_search_replace(lines, &block, (start, end));
        let description = format!("LLM fix for {} at line {}", bug.category, bug.line);
        Some((fixed, description))
    }

    fn apply_one(&self, entry: &FixPlanEntry, repo: &Path) -> Outcome {
        let Some(target) = entry.target_file.as_deref() else {
            let reason = format!("Target file not found: {}", entry.bug.file);
            return Self::skipped(entry, SkipStatus::FileNotFound, reason);
        };
        let rel = relative_display(target, repo);
        if is_test_file(&rel) || is_test_file(&entry.bug.file) {
            let reason = "Test file protection (double check).";
            return Self::skipped(entry, SkipStatus::SkippedTestFile, reason);
        }
        if !target.is_file() {
            let reason = format!("Target file not found: {rel}");
            return Self::skipped(entry, SkipStatus::FileNotFound, reason);
        }
        let text = match fs::read_to_string(target) {
            Ok(text) => text,
            Err(err) => return Self::skipped(entry, SkipStatus::ReadError, err.to_string()),
        };
        let source = SourceText::parse(&text);

        let mut candidate = None;
        if entry.strategy.is_deterministic() {
            match apply_rule(entry.strategy, &source.lines, &entry.bug) {
                Some(fix) => {
                    candidate = Some((fix.lines, fix.description, PatchMethod::Deterministic));
                }
                None => {
                    info!(strategy = %entry.strategy, file = %rel, "rule fell through to model");
                }
            }
        }
        if candidate.is_none()
            && let Some((lines, description)) = self.model_fix(entry, &source.lines, &rel)
        {
            candidate = Some((lines, description, PatchMethod::Llm));
        }
        let Some((new_lines, description, method)) = candidate else {
            let strategy = entry.strategy;
            let reason = format!("Could not generate a fix via strategy '{strategy}'.");
            return Self::skipped(entry, SkipStatus::NoFixGenerated, reason);
        };
        if new_lines == source.lines {
            let reason = "Fix produced no change.";
            return Self::skipped(entry, SkipStatus::NoFixGenerated, reason);
        }

        let changed = changed_line_count(&source.lines, &new_lines);
        let cap = self.max_changed_lines;
        if changed > cap {
            warn!(file = %rel, changed, cap, "patch exceeds change cap");
            let reason = format!("Patch changes {changed} lines (cap {cap}).");
            return Self::skipped(entry, SkipStatus::RejectedChangeCap, reason);
        }

        let rendered = source.with_lines(new_lines.clone()).render();
        if let Err(err) = fs::write(target, rendered) {
            return Self::skipped(entry, SkipStatus::WriteError, err.to_string());
        }
        info!(file = %rel, line = entry.bug.line, method = ?method, "patch applied");
        Outcome::Applied(AppliedPatch {
            bug: entry.bug.clone(),
            file: rel,
            method,
            description,
            diff: diff_summary(&source.lines, &new_lines, cap),
        })
    }
}

enum Outcome {
    Applied(AppliedPatch),
    Skipped(SkippedPatch),
}

fn relative_display(target: &Path, repo: &Path) -> String {
    match target.strip_prefix(repo) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => display_path(&target.to_string_lossy()),
    }
}

/// Actionable entries grouped by target file (sorted), highest line first.
pub fn application_order(plan: &[FixPlanEntry]) -> Vec<&FixPlanEntry> {
    let mut by_file: BTreeMap<String, Vec<&FixPlanEntry>> = BTreeMap::new();
    for entry in plan.iter().filter(|e| e.strategy.is_actionable()) {
        let key = entry
            .target_file
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.bug.file.clone());
        by_file.entry(key).or_default().push(entry);
    }
    by_file
        .into_values()
        .flat_map(|mut entries| {
            entries.sort_by(|a, b| b.bug.line.cmp(&a.bug.line));
            entries
        })
        .collect()
}

impl Tool for PatcherTool<'_> {
    fn name(&self) -> &'static str {
        "patch_applier"
    }

    fn description(&self) -> &'static str {
        "Applies the fix plan bottom-up per file: rules first, then model search/replace."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::FixPlan, StateKey::RepoPath]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[StateKey::AppliedPatches, StateKey::SkippedPatches]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let plan = state.fix_plan.as_deref().unwrap_or_default();
        let Some(repo) = state.repo_path.as_deref() else {
            return Ok(ToolResult::new(self.name(), ToolStatus::Skipped, "No repository path."));
        };
        if plan.is_empty() {
            let outputs = vec![
                StateUpdate::AppliedPatches(Vec::new()),
                StateUpdate::SkippedPatches(Vec::new()),
            ];
            let result = ToolResult::new(self.name(), ToolStatus::Skipped, "Empty fix plan.");
            return Ok(result.with_outputs(outputs));
        }

        let mut applied = Vec::new();
        let mut skipped: Vec<SkippedPatch> = plan
            .iter()
            .filter(|e| !e.strategy.is_actionable())
            .map(|e| SkippedPatch {
                bug: e.bug.clone(),
                status: if e.strategy == Strategy::SkipTestFile {
                    SkipStatus::SkippedSkipTestFile
                } else {
                    SkipStatus::SkippedUnresolvable
                },
                reason: e.description.clone(),
            })
            .collect();

        for entry in application_order(plan) {
            match self.apply_one(entry, repo) {
                Outcome::Applied(patch) => applied.push(patch),
                Outcome::Skipped(skip) => {
                    info!(
                        file = %skip.bug.file,
                        status = ?skip.status,
                        reason = %skip.reason,
                        "patch skipped"
                    );
                    skipped.push(skip);
                }
            }
        }

        let status = if applied.is_empty() {
            ToolStatus::Failure
        } else {
            ToolStatus::Success
        };
        let summary = format!(
            "Applied {}/{} patch(es), skipped {}.",
            applied.len(),
            plan.len(),
            skipped.len()
        );
        Ok(ToolResult::new(self.name(), status, summary).with_outputs(vec![
            StateUpdate::AppliedPatches(applied),
            StateUpdate::SkippedPatches(skipped),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::core::memory::RunMemory;
    use crate::core::types::{BugRecord, Category};
    use crate::test_support::ScriptedModel;

    fn entry(repo: &Path, bug: BugRecord, strategy: Strategy) -> FixPlanEntry {
        FixPlanEntry {
            target_file: Some(repo.join(&bug.file)),
            bug,
            strategy,
            source_context: String::new(),
            description: String::new(),
            fix_hint: String::new(),
        }
    }

    fn repo_with(name: &str, text: &str) -> TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(name), text).expect("write");
        temp
    }

    fn read(temp: &TempDir, name: &str) -> String {
        fs::read_to_string(temp.path().join(name)).expect("read")
    }

    fn apply(
        tool: &PatcherTool<'_>,
        repo: &Path,
        plan: Vec<FixPlanEntry>,
    ) -> (Vec<AppliedPatch>, Vec<SkippedPatch>) {
        let mut state = WorkflowState::new(repo, None, None);
        state.apply(StateUpdate::FixPlan(plan));
        let memory = RunMemory::new();
        let ctx = ToolContext {
            iteration: 1,
            max_iterations: 5,
            memory: &memory,
            ci_unavailable: false,
        };
        let result = tool.execute(&state, &ctx).expect("execute");
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for update in result.outputs {
            match update {
                StateUpdate::AppliedPatches(a) => applied = a,
                StateUpdate::SkippedPatches(s) => skipped = s,
                other => panic!("unexpected output {other:?}"),
            }
        }
        (applied, skipped)
    }

    #[test]
    fn appends_colon_and_keeps_trailing_newline() {
        let temp = repo_with("calc.py", "def add(a, b)\n    return a + b\n");
        let bug = BugRecord::new("calc.py", 1, Category::Syntax, "SyntaxError: expected ':'");
        let plan = vec![entry(temp.path(), bug, Strategy::DeterministicColon)];

        let (applied, skipped) = apply(&PatcherTool::new(None, 20), temp.path(), plan);

        assert!(skipped.is_empty());
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].file, "calc.py");
        assert_eq!(applied[0].method, PatchMethod::Deterministic);
        assert_eq!(applied[0].diff, ["L1: -def add(a, b) → +def add(a, b):"]);
        assert_eq!(read(&temp, "calc.py"), "def add(a, b):\n    return a + b\n");
    }

    #[test]
    fn bottom_up_order_within_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let at = |file: &str, line: u32, strategy| {
            let bug = BugRecord::new(file, line, Category::Syntax, "m");
            entry(temp.path(), bug, strategy)
        };
        let plan = vec![
            at("b.py", 5, Strategy::DeterministicColon),
            at("b.py", 20, Strategy::DeterministicColon),
            at("a.py", 3, Strategy::DeterministicColon),
            at("a.py", 1, Strategy::SkipTestFile),
        ];
        let order: Vec<(PathBuf, u32)> = application_order(&plan)
            .into_iter()
            .map(|e| (e.target_file.clone().expect("target"), e.bug.line))
            .collect();
        assert_eq!(
            order,
            vec![
                (temp.path().join("a.py"), 3),
                (temp.path().join("b.py"), 20),
                (temp.path().join("b.py"), 5),
            ]
        );
    }

    #[test]
    fn oversized_model_patch_is_rejected_and_file_untouched() {
        let original: String = (1..=40).map(|n| format!("x{n} = {n}\n")).collect();
        let temp = repo_with("big.py", &original);
        let replacement: String = (1..=30).map(|n| format!("y{n} = {n}\n")).collect();
        let reply = format!("<<<<\nx5 = 5\n====\n{replacement}>>>>");
        let model = ScriptedModel::new(vec![Ok(reply)]);
        let bug = BugRecord::new("big.py", 5, Category::Logic, "wrong value");
        let plan = vec![entry(temp.path(), bug, Strategy::Llm)];

        let (applied, skipped) = apply(&PatcherTool::new(Some(&model), 20), temp.path(), plan);

        assert!(applied.is_empty());
        assert_eq!(skipped[0].status, SkipStatus::RejectedChangeCap);
        assert_eq!(read(&temp, "big.py"), original);
    }

    #[test]
    fn test_targets_are_never_written() {
        let temp = repo_with("test_calc.py", "def test_add()\n");
        let bug = BugRecord::new("test_calc.py", 1, Category::Syntax, "expected ':'");
        let plan = vec![entry(temp.path(), bug, Strategy::DeterministicColon)];

        let (applied, skipped) = apply(&PatcherTool::new(None, 20), temp.path(), plan);

        assert!(applied.is_empty());
        assert_eq!(skipped[0].status, SkipStatus::SkippedTestFile);
        assert_eq!(read(&temp, "test_calc.py"), "def test_add()\n");
    }

    #[test]
    fn no_model_and_no_rule_reports_no_fix() {
        let temp = repo_with("app.py", "value = compute()\n");
        let bug = BugRecord::new("app.py", 1, Category::Logic, "wrong");
        let plan = vec![entry(temp.path(), bug, Strategy::Llm)];

        let (_, skipped) = apply(&PatcherTool::new(None, 20), temp.path(), plan);

        assert_eq!(skipped[0].status, SkipStatus::NoFixGenerated);
    }

    #[test]
    fn model_search_block_is_applied() {
        let temp = repo_with("app.py", "def area(w, h):\n    return w + h\n");
        let reply = "<<<<\n    return w + h\n====\n   2 |     return w * h\n>>>>";
        let model = ScriptedModel::new(vec![Ok(reply.to_string())]);
        let bug = BugRecord::new("app.py", 2, Category::Logic, "area is wrong");
        let plan = vec![entry(temp.path(), bug, Strategy::Llm)];

        let (applied, _) = apply(&PatcherTool::new(Some(&model), 20), temp.path(), plan);

        assert_eq!(applied[0].method, PatchMethod::Llm);
        assert_eq!(read(&temp, "app.py"), "def area(w, h):\n    return w * h\n");
    }
}
