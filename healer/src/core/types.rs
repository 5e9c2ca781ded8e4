//! Shared deterministic types for the healing pipeline.
//!
//! These types are the stable contracts between the classifier, planner,
//! patch applier, and run memory. They carry no I/O and serialize in a fixed
//! field order so that exported documents stay byte-stable.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Failure category assigned to every bug record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Syntax,
    Logic,
    TypeError,
    Import,
    Indentation,
    Linting,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Syntax,
        Category::Logic,
        Category::TypeError,
        Category::Import,
        Category::Indentation,
        Category::Linting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Syntax => "SYNTAX",
            Category::Logic => "LOGIC",
            Category::TypeError => "TYPE_ERROR",
            Category::Import => "IMPORT",
            Category::Indentation => "INDENTATION",
            Category::Linting => "LINTING",
        }
    }

    /// Parse a category name case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|c| c.as_str() == upper)
    }

    pub fn severity(self) -> Severity {
        match self {
            Category::Syntax | Category::Indentation | Category::Import => Severity::High,
            Category::TypeError | Category::Logic => Severity::Medium,
            Category::Linting => Severity::Low,
        }
    }

    /// Short remediation hint handed to the planner and the model prompt.
    pub fn fix_hint(self) -> &'static str {
        match self {
            Category::Syntax => "Check for missing colons, brackets, or parentheses.",
            Category::Indentation => "Align indentation to surrounding block.",
            Category::Import => "Verify module name and ensure package is installed.",
            Category::TypeError => "Check argument types match the function signature.",
            Category::Logic => "Review assertion: expected vs actual values differ.",
            Category::Linting => "Remove unused import or fix style violation.",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity ordering: `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// A located, categorized failure extracted from log text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugRecord {
    pub file: String,
    pub line: u32,
    #[serde(rename = "bug_type")]
    pub category: Category,
    pub message: String,
}

/// Identity of a bug within one classification pass.
pub type BugKey = (String, u32, Category);

impl BugRecord {
    pub fn new(
        file: impl Into<String>,
        line: u32,
        category: Category,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            category,
            message: message.into(),
        }
    }

    pub fn key(&self) -> BugKey {
        (self.file.clone(), self.line, self.category)
    }
}

/// A bug enriched by the classifier tool with triage metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedBug {
    #[serde(flatten)]
    pub bug: BugRecord,
    pub severity: Severity,
    pub fix_hint: String,
}

impl ClassifiedBug {
    pub fn from_bug(bug: BugRecord) -> Self {
        Self {
            severity: bug.category.severity(),
            fix_hint: bug.category.fix_hint().to_string(),
            bug,
        }
    }
}

/// Remediation strategy chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DeterministicColon,
    DeterministicSemicolon,
    DeterministicBracket,
    DeterministicIndent,
    DeterministicUnusedImport,
    DeterministicTypeError,
    DeterministicLogic,
    DeterministicZeroDivision,
    DeterministicIndexError,
    DeterministicRecursionError,
    Llm,
    SkipTestFile,
    Unresolvable,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::DeterministicColon => "deterministic_colon",
            Strategy::DeterministicSemicolon => "deterministic_semicolon",
            Strategy::DeterministicBracket => "deterministic_bracket",
            Strategy::DeterministicIndent => "deterministic_indent",
            Strategy::DeterministicUnusedImport => "deterministic_unused_import",
            Strategy::DeterministicTypeError => "deterministic_type_error",
            Strategy::DeterministicLogic => "deterministic_logic",
            Strategy::DeterministicZeroDivision => "deterministic_zero_division",
            Strategy::DeterministicIndexError => "deterministic_index_error",
            Strategy::DeterministicRecursionError => "deterministic_recursion_error",
            Strategy::Llm => "llm",
            Strategy::SkipTestFile => "skip_test_file",
            Strategy::Unresolvable => "unresolvable",
        }
    }

    /// True for strategies the patch applier is allowed to act on.
    pub fn is_actionable(self) -> bool {
        !matches!(self, Strategy::SkipTestFile | Strategy::Unresolvable)
    }

    pub fn is_deterministic(self) -> bool {
        self.is_actionable() && self != Strategy::Llm
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned remediation. Produced by planning, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPlanEntry {
    pub bug: BugRecord,
    pub strategy: Strategy,
    /// Resolved absolute path; `None` when the file could not be located.
    pub target_file: Option<PathBuf>,
    pub source_context: String,
    pub description: String,
    pub fix_hint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMethod {
    Deterministic,
    Llm,
}

/// A successful on-disk edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub bug: BugRecord,
    /// Path relative to the repository root.
    pub file: String,
    pub method: PatchMethod,
    pub description: String,
    /// Line-level deltas (`L{n}: -old → +new`), truncated to the change cap.
    pub diff: Vec<String>,
}

/// Why a plan entry did not produce an applied patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStatus {
    SkippedSkipTestFile,
    SkippedUnresolvable,
    SkippedTestFile,
    FileNotFound,
    ReadError,
    WriteError,
    RejectedChangeCap,
    NoFixGenerated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPatch {
    pub bug: BugRecord,
    pub status: SkipStatus,
    pub reason: String,
}

/// Outcome of the push half of the commit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    PushFailed,
    Skipped,
    Failed,
}

/// Terminal status stored in run memory for one CI observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiRunStatus {
    Success,
    Failure,
    Timeout,
}

impl CiRunStatus {
    /// Map a remote CI conclusion (`success`, `failure`, `timed_out`, ...) onto the ledger status.
    pub fn from_conclusion(conclusion: &str) -> Self {
        match conclusion.trim().to_ascii_lowercase().as_str() {
            "success" => CiRunStatus::Success,
            "timeout" | "timed_out" => CiRunStatus::Timeout,
            _ => CiRunStatus::Failure,
        }
    }
}

/// Free-text verdict tag recorded on iteration reports and verification output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    PassLocal,
    Partial,
    Fail,
    NoBugsClassified,
    NoNewFailures,
    NoActionableFixes,
    NoPatchesApplied,
    CommitFailed,
    PushFailedFixesApplied,
    NoCiLogs,
    FailLocalNoCi,
    CiNotConfigured,
    InputsMissing,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::PassLocal => "pass_local",
            Verdict::Partial => "partial",
            Verdict::Fail => "fail",
            Verdict::NoBugsClassified => "no_bugs_classified",
            Verdict::NoNewFailures => "no_new_failures",
            Verdict::NoActionableFixes => "no_actionable_fixes",
            Verdict::NoPatchesApplied => "no_patches_applied",
            Verdict::CommitFailed => "commit_failed",
            Verdict::PushFailedFixesApplied => "push_failed_fixes_applied",
            Verdict::NoCiLogs => "no_ci_logs",
            Verdict::FailLocalNoCi => "fail_local_no_ci",
            Verdict::CiNotConfigured => "ci_not_configured",
            Verdict::InputsMissing => "inputs_missing",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
