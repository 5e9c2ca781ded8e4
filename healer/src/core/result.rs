//! Canonical result document for one pipeline run.
//!
//! Built solely from [`RunMemory`] plus run identity. Every list is sorted so
//! the document is byte-stable once [`ResultDocument::strip_volatile`] blanks
//! the timing fields.

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::memory::{FailureRecord, FixRecord, RunMemory};
use crate::core::path::{basename, display_path};
use crate::core::types::CiRunStatus;

/// Literal tag every fix commit message starts with.
pub const COMMIT_TAG: &str = "[AI-AGENT]";

pub const SCORE_BASE: i64 = 100;
pub const SPEED_BONUS: i64 = 10;
pub const COMMIT_PENALTY_PER_COMMIT: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CiLabel {
    Passed,
    Failed,
}

impl CiLabel {
    fn from_status(status: CiRunStatus) -> Self {
        if status == CiRunStatus::Success {
            CiLabel::Passed
        } else {
            CiLabel::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub file: String,
    pub line: u32,
    pub bug_type: String,
    pub message: String,
    pub description: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Verified,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEntry {
    pub file: String,
    pub bug_type: String,
    pub line: u32,
    pub commit_message: String,
    pub status: FixStatus,
    pub description: String,
    pub failure_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub iteration: u32,
    pub status: CiLabel,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub base: i64,
    pub speed_bonus: i64,
    pub commit_penalty: i64,
    pub total_commits: usize,
    pub final_score: i64,
}

/// Score tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRules {
    pub speed_bonus_threshold_secs: f64,
    pub free_commits: usize,
}

impl Default for ScoreRules {
    fn default() -> Self {
        Self {
            speed_bonus_threshold_secs: 300.0,
            free_commits: 20,
        }
    }
}

/// Identity and timing of the run being exported.
#[derive(Debug, Clone, PartialEq)]
pub struct RunIdentity {
    pub repository_url: String,
    pub branch: String,
    pub team_name: String,
    pub leader_name: String,
    pub runtime_seconds: f64,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub repository_url: String,
    pub branch: String,
    pub team_name: String,
    pub leader_name: String,
    pub total_failures_detected: usize,
    pub total_fixes_applied: usize,
    pub final_ci_status: CiLabel,
    pub runtime_seconds: f64,
    pub failures_detected: Vec<FailureEntry>,
    pub fixes: Vec<FixEntry>,
    pub ci_timeline: Vec<TimelineEntry>,
    pub score: Score,
    pub generated_at: String,
}

/// Build the canonical document from run memory.
pub fn build_result(
    memory: &RunMemory,
    identity: &RunIdentity,
    rules: &ScoreRules,
) -> ResultDocument {
    let failures = memory.failures();
    let fix_records = memory.fixes();
    let ci_runs = memory.ci_runs();

    let failures_detected = failure_entries(&failures);
    let fixes = fix_entries(&fix_records, &failures, memory);
    let ci_timeline: Vec<TimelineEntry> = ci_runs
        .iter()
        .map(|run| TimelineEntry {
            iteration: run.iteration,
            status: CiLabel::from_status(run.status),
            timestamp: run.timestamp.clone(),
        })
        .collect();

    let final_ci_status = match memory.latest_ci_run() {
        Some(run) => CiLabel::from_status(run.status),
        None if failures.is_empty() => CiLabel::Passed,
        None => CiLabel::Failed,
    };
    let total_commits = fix_records
        .iter()
        .filter(|fix| !fix.commit_sha.is_empty())
        .map(|fix| fix.commit_sha.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    let runtime_seconds = round2(identity.runtime_seconds);

    ResultDocument {
        repository_url: identity.repository_url.clone(),
        branch: identity.branch.clone(),
        team_name: identity.team_name.clone(),
        leader_name: identity.leader_name.clone(),
        total_failures_detected: failures_detected.len(),
        total_fixes_applied: fixes.len(),
        final_ci_status,
        runtime_seconds,
        failures_detected,
        fixes,
        ci_timeline,
        score: score(runtime_seconds, total_commits, rules),
        generated_at: identity.generated_at.clone(),
    }
}

pub fn score(runtime_seconds: f64, total_commits: usize, rules: &ScoreRules) -> Score {
    let speed_bonus = if runtime_seconds < rules.speed_bonus_threshold_secs {
        SPEED_BONUS
    } else {
        0
    };
    let over = total_commits.saturating_sub(rules.free_commits) as i64;
    let commit_penalty = -COMMIT_PENALTY_PER_COMMIT * over;
    Score {
        base: SCORE_BASE,
        speed_bonus,
        commit_penalty,
        total_commits,
        final_score: (SCORE_BASE + speed_bonus + commit_penalty).max(0),
    }
}

/// Prefix `message` with the commit tag unless it already carries it.
pub fn tagged_commit_message(message: &str) -> String {
    if message.starts_with(COMMIT_TAG) {
        message.to_string()
    } else {
        format!("{COMMIT_TAG} {message}")
    }
}

fn failure_entries(failures: &[FailureRecord]) -> Vec<FailureEntry> {
    let mut seen = HashSet::new();
    let mut entries: Vec<FailureEntry> = failures
        .iter()
        .filter(|f| seen.insert(f.bug.key()))
        .map(|f| FailureEntry {
            file: f.bug.file.clone(),
            line: f.bug.line,
            bug_type: f.bug.category.to_string(),
            message: f.bug.message.clone(),
            description: format!("{} — Line {}: {}", f.bug.file, f.bug.line, f.bug.message),
            iteration: f.iteration,
        })
        .collect();
    entries.sort_by(|a, b| (&a.file, a.line, &a.bug_type).cmp(&(&b.file, b.line, &b.bug_type)));
    entries
}

fn fix_entries(
    fixes: &[FixRecord],
    failures: &[FailureRecord],
    memory: &RunMemory,
) -> Vec<FixEntry> {
    let ci_runs = memory.ci_runs();
    let mut entries: Vec<FixEntry> = fixes
        .iter()
        .map(|fix| {
            let verified = ci_runs
                .iter()
                .any(|ci| ci.iteration >= fix.iteration && ci.status == CiRunStatus::Success);
            let file = display_path(&fix.file);
            let (bug_type, failure_message) = match matching_failure(fix, failures) {
                Some(f) => (f.bug.category.to_string(), f.bug.message.clone()),
                None => (fix.category.to_string(), fix.message.clone()),
            };
            let commit_message = tagged_commit_message(&fix.description);
            let description = format!(
                "{bug_type} error in {file} line {} → Fix: {commit_message}",
                fix.line
            );
            FixEntry {
                description,
                file,
                bug_type,
                line: fix.line,
                commit_message,
                status: if verified {
                    FixStatus::Verified
                } else {
                    FixStatus::Applied
                },
                failure_message,
            }
        })
        .collect();
    entries.sort_by(|a, b| (&a.file, a.line, &a.bug_type).cmp(&(&b.file, b.line, &b.bug_type)));
    entries
}

/// Find the failure a fix addressed: exact (file, line), then file, then
/// basename with line, then basename.
fn matching_failure<'a>(
    fix: &FixRecord,
    failures: &'a [FailureRecord],
) -> Option<&'a FailureRecord> {
    let fix_file = display_path(&fix.file);
    let fix_base = basename(&fix_file).to_string();
    let same_file = |f: &&FailureRecord| display_path(&f.bug.file) == fix_file;
    let same_base = |f: &&FailureRecord| basename(&f.bug.file) == fix_base;
    let same_line = |f: &&FailureRecord| f.bug.line == fix.line;

    failures
        .iter()
        .find(|f| same_file(f) && same_line(f))
        .or_else(|| failures.iter().find(same_file))
        .or_else(|| failures.iter().find(|f| same_base(f) && same_line(f)))
        .or_else(|| failures.iter().find(same_base))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl ResultDocument {
    /// Copy with generation time, runtime, and timeline timestamps blanked.
    pub fn strip_volatile(&self) -> Self {
        let mut stripped = self.clone();
        stripped.generated_at = String::new();
        stripped.runtime_seconds = 0.0;
        for entry in &mut stripped.ci_timeline {
            entry.timestamp = String::new();
        }
        stripped
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_pretty_json(&self) -> Result<String> {
        let mut buf = serde_json::to_string_pretty(self)?;
        buf.push('\n');
        Ok(buf)
    }

    /// Hex sha256 of the stripped document's pretty JSON.
    pub fn digest(&self) -> Result<String> {
        let json = self.strip_volatile().to_pretty_json()?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AppliedPatch, BugRecord, Category, PatchMethod};

    fn identity(runtime: f64, generated_at: &str) -> RunIdentity {
        RunIdentity {
            repository_url: "https://github.com/acme/app".into(),
            branch: "ACME_ADA_AI_Fix".into(),
            team_name: "Acme".into(),
            leader_name: "Ada".into(),
            runtime_seconds: runtime,
            generated_at: generated_at.into(),
        }
    }

    const MISSING_COLON: &str = "SyntaxError: expected ':'";

    fn build(memory: &RunMemory, runtime: f64) -> ResultDocument {
        build_result(memory, &identity(runtime, "now"), &ScoreRules::default())
    }

    fn healed_memory() -> RunMemory {
        let bug = BugRecord::new("src/app.py", 3, Category::Syntax, MISSING_COLON);
        let mut memory = RunMemory::new();
        memory.append_failures(1, std::slice::from_ref(&bug));
        memory.append_fixes(
            1,
            &[AppliedPatch {
                bug,
                file: "src/app.py".into(),
                method: PatchMethod::Deterministic,
                description: "Added missing colon at line 3".into(),
                diff: vec!["L3: -def add(a, b) → +def add(a, b):".into()],
            }],
            "abc1234",
        );
        memory.append_ci_run(1, CiRunStatus::Success, "2026-01-01T00:00:00Z");
        memory
    }

    #[test]
    fn builds_canonical_descriptions() {
        let doc = build(&healed_memory(), 12.346);
        assert_eq!(doc.final_ci_status, CiLabel::Passed);
        assert_eq!(doc.runtime_seconds, 12.35);
        assert_eq!(
            doc.failures_detected[0].description,
            "src/app.py — Line 3: SyntaxError: expected ':'"
        );
        let fix = &doc.fixes[0];
        assert_eq!(fix.status, FixStatus::Verified);
        let commit_message = "[AI-AGENT] Added missing colon at line 3";
        assert_eq!(fix.commit_message, commit_message);
        assert_eq!(
            fix.description,
            "SYNTAX error in src/app.py line 3 → Fix: [AI-AGENT] Added missing colon at line 3"
        );
        assert_eq!(fix.failure_message, MISSING_COLON);
        assert_eq!(doc.score.total_commits, 1);
        assert_eq!(doc.score.final_score, 110);
    }

    #[test]
    fn empty_memory_reports_passed() {
        let doc = build(&RunMemory::new(), 1.0);
        assert_eq!(doc.final_ci_status, CiLabel::Passed);
        assert!(doc.fixes.is_empty());
    }

    #[test]
    fn score_penalizes_commits_beyond_allowance() {
        let rules = ScoreRules::default();
        let s = score(400.0, 25, &rules);
        assert_eq!(s.speed_bonus, 0);
        assert_eq!(s.commit_penalty, -10);
        assert_eq!(s.final_score, 90);
        assert_eq!(score(10.0, 200, &rules).final_score, 0);
    }

    #[test]
    fn document_serializes_in_canonical_field_order() {
        let doc = build(&healed_memory(), 1.0);
        let json = doc.to_pretty_json().expect("json");
        let order = [
            "repository_url",
            "branch",
            "team_name",
            "leader_name",
            "total_failures_detected",
            "total_fixes_applied",
            "final_ci_status",
            "runtime_seconds",
            "failures_detected",
            "fixes",
            "ci_timeline",
            "score",
            "generated_at",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|key| json.find(&format!("\"{key}\"")).expect("key present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(json.ends_with("}\n"));
    }

    #[test]
    fn digest_ignores_volatile_fields() {
        let memory = healed_memory();
        let a = build_result(&memory, &identity(1.0, "t1"), &ScoreRules::default());
        let b = build_result(&memory, &identity(2.5, "t2"), &ScoreRules::default());
        assert_ne!(a, b);
        assert_eq!(a.digest().expect("digest"), b.digest().expect("digest"));
        assert_eq!(a.digest().expect("digest").len(), 64);
    }
}
