//! Pure planning decisions: which strategy a bug gets, and when a prior fix
//! forces escalation to the model.

use std::collections::{BTreeSet, HashSet};

use crate::core::rules::unbalanced_brackets;
use crate::core::types::{BugRecord, Category, ClassifiedBug, FixPlanEntry, Strategy};

/// Lines of context read above and below the reported line.
pub const CONTEXT_RADIUS: usize = 15;

/// Choose a strategy for `bug` given the target file's lines.
///
/// Returns the strategy and a human-readable description of the intended fix.
pub fn choose_strategy(bug: &BugRecord, lines: &[String]) -> (Strategy, String) {
    let line_no = bug.line as usize;
    let message = bug.message.as_str();
    let lower = message.to_lowercase();
    let category = bug.category;

    if line_no < 1 || line_no > lines.len() {
        return (Strategy::Llm, "Line out of range; will use LLM to infer fix.".to_string());
    }
    let original = lines[line_no - 1].as_str();
    let syntax = category == Category::Syntax;
    let logic = category == Category::Logic;

    if category == Category::Indentation {
        return (
            Strategy::DeterministicIndent,
            format!("Fix indentation at line {line_no} to match surrounding block."),
        );
    }
    if syntax && lower.contains("expected ':'") && !original.trim_end().ends_with(':') {
        return (
            Strategy::DeterministicColon,
            format!("Add missing colon at end of line {line_no}."),
        );
    }
    if syntax && lower.contains("missing semicolon") {
        return (
            Strategy::DeterministicSemicolon,
            format!("Add missing semicolon at end of line {line_no}."),
        );
    }
    if syntax && (message.contains("unexpected EOF") || lower.contains("expected")) {
        let (paren, square, curly) = unbalanced_brackets(original.trim_end());
        if paren > 0 || square > 0 || curly > 0 {
            return (
                Strategy::DeterministicBracket,
                format!("Add missing bracket(s) at line {line_no}."),
            );
        }
    }
    let unused = ["imported but unused", "f401", "unused import"];
    if category == Category::Linting && unused.iter().any(|hint| lower.contains(hint)) {
        return (
            Strategy::DeterministicUnusedImport,
            format!("Remove unused import at line {line_no}: {message}"),
        );
    }
    if category == Category::TypeError && lower.contains("is not a function") {
        return (
            Strategy::DeterministicTypeError,
            format!("Fix type error at line {line_no}: {message}"),
        );
    }
    let operator_hints = [
        "should multiply",
        "should divide",
        "should add",
        "should subtract",
    ];
    if logic && operator_hints.iter().any(|hint| lower.contains(hint)) {
        return (
            Strategy::DeterministicLogic,
            format!("Fix logic error at line {line_no}: {message}"),
        );
    }
    if lower.contains("zerodivisionerror") || (logic && original.contains('/')) {
        return (
            Strategy::DeterministicZeroDivision,
            format!("Add zero-division guard at line {line_no}: {message}"),
        );
    }
    let indexes = original.contains('[') || original.contains("split");
    if lower.contains("indexerror") || (logic && indexes) {
        return (
            Strategy::DeterministicIndexError,
            format!("Add bounds check at line {line_no}: {message}"),
        );
    }
    if lower.contains("recursion") {
        return (
            Strategy::DeterministicRecursionError,
            format!("Add recursion base-case guard at line {line_no}: {message}"),
        );
    }
    (
        Strategy::Llm,
        format!("Use LLM (temperature=0) to fix {category} at line {line_no}: {message}"),
    )
}

/// Force a deterministic entry to `llm` when `(file, category)` was already fixed once.
pub fn escalate_if_retried(entry: &mut FixPlanEntry, prior_fixes: &BTreeSet<(String, Category)>) {
    if !entry.strategy.is_deterministic() {
        return;
    }
    let key = (entry.bug.file.clone(), entry.bug.category);
    if prior_fixes.contains(&key) {
        entry.strategy = Strategy::Llm;
        entry.description = format!(
            "Escalated to LLM: deterministic fix already failed for {} in {}",
            entry.bug.category, entry.bug.file
        );
    }
}

/// Keep the first bug per `(file, line)`.
pub fn dedupe_locations(bugs: &[ClassifiedBug]) -> Vec<&ClassifiedBug> {
    let mut seen: HashSet<(&str, u32)> = HashSet::new();
    bugs.iter()
        .filter(|b| seen.insert((b.bug.file.as_str(), b.bug.line)))
        .collect()
}

/// Plan entry for a bug that must never be edited.
pub fn skip_test_entry(bug: &ClassifiedBug) -> FixPlanEntry {
    FixPlanEntry {
        bug: bug.bug.clone(),
        strategy: Strategy::SkipTestFile,
        target_file: None,
        source_context: String::new(),
        description: "Will not modify test files.".to_string(),
        fix_hint: bug.fix_hint.clone(),
    }
}

/// Plan entry for a bug whose file could not be located or read.
pub fn unresolvable_entry(bug: &ClassifiedBug, reason: impl Into<String>) -> FixPlanEntry {
    FixPlanEntry {
        bug: bug.bug.clone(),
        strategy: Strategy::Unresolvable,
        target_file: None,
        source_context: String::new(),
        description: reason.into(),
        fix_hint: bug.fix_hint.clone(),
    }
}
