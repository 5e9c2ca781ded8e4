//! Append-only run memory: the ledger of failures, fixes, and CI runs.
//!
//! Every collection is keyed by iteration. Appending for iteration `N` replaces
//! only `N`'s own entries, so re-submitting an iteration is idempotent and
//! records from other iterations are never touched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{AppliedPatch, BugRecord, Category, CiRunStatus, PatchMethod};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub iteration: u32,
    #[serde(flatten)]
    pub bug: BugRecord,
}

/// One committed patch. `file` is the repository-relative path that was edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub iteration: u32,
    pub file: String,
    pub line: u32,
    #[serde(rename = "bug_type")]
    pub category: Category,
    pub message: String,
    pub method: PatchMethod,
    pub description: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiRunRecord {
    pub iteration: u32,
    pub status: CiRunStatus,
    pub timestamp: String,
}

/// Summary counts attached to every export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total_failures: usize,
    pub total_fixes: usize,
    pub total_ci_runs: usize,
    pub files_touched: usize,
}

/// Aggregated, sorted view of a run's memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryExport {
    pub failures: Vec<FailureRecord>,
    pub fixes: Vec<FixRecord>,
    pub ci_runs: Vec<CiRunRecord>,
    pub summary: MemorySummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMemory {
    failures: BTreeMap<u32, Vec<FailureRecord>>,
    fixes: BTreeMap<u32, Vec<FixRecord>>,
    ci_runs: BTreeMap<u32, Vec<CiRunRecord>>,
}

impl RunMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failures observed in `iteration`, replacing that iteration's previous set.
    pub fn append_failures(&mut self, iteration: u32, bugs: &[BugRecord]) {
        let records = bugs
            .iter()
            .map(|bug| FailureRecord {
                iteration,
                bug: bug.clone(),
            })
            .collect();
        self.failures.insert(iteration, records);
    }

    /// Record the patches committed in `iteration` under `commit_sha`.
    pub fn append_fixes(&mut self, iteration: u32, patches: &[AppliedPatch], commit_sha: &str) {
        let records = patches
            .iter()
            .map(|patch| FixRecord {
                iteration,
                file: patch.file.clone(),
                line: patch.bug.line,
                category: patch.bug.category,
                message: patch.bug.message.clone(),
                method: patch.method,
                description: patch.description.clone(),
                commit_sha: commit_sha.to_string(),
            })
            .collect();
        self.fixes.insert(iteration, records);
    }

    /// Record the CI observation for `iteration`. One record per iteration; a
    /// second call for the same iteration replaces the first.
    pub fn append_ci_run(
        &mut self,
        iteration: u32,
        status: CiRunStatus,
        timestamp: impl Into<String>,
    ) {
        self.ci_runs.insert(
            iteration,
            vec![CiRunRecord {
                iteration,
                status,
                timestamp: timestamp.into(),
            }],
        );
    }

    /// All failures sorted by (file, line, iteration).
    pub fn failures(&self) -> Vec<FailureRecord> {
        let mut all: Vec<FailureRecord> = self.failures.values().flatten().cloned().collect();
        all.sort_by(|a, b| {
            (&a.bug.file, a.bug.line, a.iteration, a.bug.category)
                .cmp(&(&b.bug.file, b.bug.line, b.iteration, b.bug.category))
        });
        all
    }

    /// All fixes sorted by (file, line, iteration).
    pub fn fixes(&self) -> Vec<FixRecord> {
        let mut all: Vec<FixRecord> = self.fixes.values().flatten().cloned().collect();
        all.sort_by(|a, b| {
            (&a.file, a.line, a.iteration, a.category)
                .cmp(&(&b.file, b.line, b.iteration, b.category))
        });
        all
    }

    /// CI runs in iteration order.
    pub fn ci_runs(&self) -> Vec<CiRunRecord> {
        self.ci_runs.values().flatten().cloned().collect()
    }

    pub fn latest_ci_run(&self) -> Option<&CiRunRecord> {
        self.ci_runs
            .values()
            .next_back()
            .and_then(|runs| runs.last())
    }

    pub fn failures_for(&self, iteration: u32) -> &[FailureRecord] {
        self.failures
            .get(&iteration)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn fixes_for(&self, iteration: u32) -> &[FixRecord] {
        self.fixes
            .get(&iteration)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn ci_runs_for(&self, iteration: u32) -> &[CiRunRecord] {
        self.ci_runs
            .get(&iteration)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn ci_run_count(&self) -> usize {
        self.ci_runs.values().map(Vec::len).sum()
    }

    /// (file, category) pairs that already received a fix in any iteration.
    pub fn fixed_signatures(&self) -> BTreeSet<(String, Category)> {
        self.fixes
            .values()
            .flatten()
            .map(|fix| (fix.file.clone(), fix.category))
            .collect()
    }

    pub fn summary(&self) -> MemorySummary {
        let files: BTreeSet<&str> = self
            .failures
            .values()
            .flatten()
            .map(|f| f.bug.file.as_str())
            .chain(self.fixes.values().flatten().map(|f| f.file.as_str()))
            .collect();
        MemorySummary {
            total_failures: self.failures.values().map(Vec::len).sum(),
            total_fixes: self.fixes.values().map(Vec::len).sum(),
            total_ci_runs: self.ci_run_count(),
            files_touched: files.len(),
        }
    }

    pub fn export(&self) -> MemoryExport {
        MemoryExport {
            failures: self.failures(),
            fixes: self.fixes(),
            ci_runs: self.ci_runs(),
            summary: self.summary(),
        }
    }
}
