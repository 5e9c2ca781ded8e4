//! Typed workflow state shared by the phase tools.
//!
//! Tools never write to [`WorkflowState`] directly. They return
//! [`StateUpdate`]s; the registry drops updates for keys the tool did not
//! declare and the loop driver applies the rest.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::{
    AppliedPatch, ClassifiedBug, FixPlanEntry, PushStatus, SkippedPatch, Verdict,
};

/// Name of a state field, used for tool input/output declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    RepoPath,
    RepoUrl,
    Branch,
    TestCommands,
    TestOutput,
    LocalAllPassed,
    PassingSuites,
    FailingSuites,
    ClassifiedBugs,
    FixPlan,
    AppliedPatches,
    SkippedPatches,
    CommitSha,
    CommitMessage,
    PushStatus,
    CiRunId,
    CiConclusion,
    CiRunUrl,
    CiStatus,
    CiNoWorkflow,
    CiLogs,
    CiPassed,
    CiFailed,
    CiFailingSuites,
    AllPassed,
    ShouldContinue,
    Verdict,
    Improvement,
    VerificationOutput,
}

impl StateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StateKey::RepoPath => "repo_path",
            StateKey::RepoUrl => "repo_url",
            StateKey::Branch => "branch",
            StateKey::TestCommands => "test_commands",
            StateKey::TestOutput => "test_output",
            StateKey::LocalAllPassed => "local_all_passed",
            StateKey::PassingSuites => "passing_suites",
            StateKey::FailingSuites => "failing_suites",
            StateKey::ClassifiedBugs => "classified_bugs",
            StateKey::FixPlan => "fix_plan",
            StateKey::AppliedPatches => "applied_patches",
            StateKey::SkippedPatches => "skipped_patches",
            StateKey::CommitSha => "commit_sha",
            StateKey::CommitMessage => "commit_message",
            StateKey::PushStatus => "push_status",
            StateKey::CiRunId => "ci_run_id",
            StateKey::CiConclusion => "ci_conclusion",
            StateKey::CiRunUrl => "ci_run_url",
            StateKey::CiStatus => "ci_status",
            StateKey::CiNoWorkflow => "ci_no_workflow",
            StateKey::CiLogs => "ci_logs",
            StateKey::CiPassed => "ci_passed",
            StateKey::CiFailed => "ci_failed",
            StateKey::CiFailingSuites => "ci_failing_suites",
            StateKey::AllPassed => "all_passed",
            StateKey::ShouldContinue => "should_continue",
            StateKey::Verdict => "verdict",
            StateKey::Improvement => "improvement",
            StateKey::VerificationOutput => "verification_output",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value written by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum StateUpdate {
    TestCommands(Vec<String>),
    TestOutput(String),
    LocalAllPassed(bool),
    PassingSuites(u32),
    FailingSuites(u32),
    ClassifiedBugs(Vec<ClassifiedBug>),
    FixPlan(Vec<FixPlanEntry>),
    AppliedPatches(Vec<AppliedPatch>),
    SkippedPatches(Vec<SkippedPatch>),
    CommitSha(String),
    CommitMessage(String),
    PushStatus(PushStatus),
    CiRunId(u64),
    CiConclusion(String),
    CiRunUrl(String),
    CiStatus(String),
    CiNoWorkflow(bool),
    CiLogs(String),
    CiPassed(u32),
    CiFailed(u32),
    CiFailingSuites(u32),
    AllPassed(bool),
    ShouldContinue(bool),
    Verdict(Verdict),
    Improvement(i64),
    VerificationOutput(String),
}

impl StateUpdate {
    pub fn key(&self) -> StateKey {
        match self {
            StateUpdate::TestCommands(_) => StateKey::TestCommands,
            StateUpdate::TestOutput(_) => StateKey::TestOutput,
            StateUpdate::LocalAllPassed(_) => StateKey::LocalAllPassed,
            StateUpdate::PassingSuites(_) => StateKey::PassingSuites,
            StateUpdate::FailingSuites(_) => StateKey::FailingSuites,
            StateUpdate::ClassifiedBugs(_) => StateKey::ClassifiedBugs,
            StateUpdate::FixPlan(_) => StateKey::FixPlan,
            StateUpdate::AppliedPatches(_) => StateKey::AppliedPatches,
            StateUpdate::SkippedPatches(_) => StateKey::SkippedPatches,
            StateUpdate::CommitSha(_) => StateKey::CommitSha,
            StateUpdate::CommitMessage(_) => StateKey::CommitMessage,
            StateUpdate::PushStatus(_) => StateKey::PushStatus,
            StateUpdate::CiRunId(_) => StateKey::CiRunId,
            StateUpdate::CiConclusion(_) => StateKey::CiConclusion,
            StateUpdate::CiRunUrl(_) => StateKey::CiRunUrl,
            StateUpdate::CiStatus(_) => StateKey::CiStatus,
            StateUpdate::CiNoWorkflow(_) => StateKey::CiNoWorkflow,
            StateUpdate::CiLogs(_) => StateKey::CiLogs,
            StateUpdate::CiPassed(_) => StateKey::CiPassed,
            StateUpdate::CiFailed(_) => StateKey::CiFailed,
            StateUpdate::CiFailingSuites(_) => StateKey::CiFailingSuites,
            StateUpdate::AllPassed(_) => StateKey::AllPassed,
            StateUpdate::ShouldContinue(_) => StateKey::ShouldContinue,
            StateUpdate::Verdict(_) => StateKey::Verdict,
            StateUpdate::Improvement(_) => StateKey::Improvement,
            StateUpdate::VerificationOutput(_) => StateKey::VerificationOutput,
        }
    }
}

/// State shared across phases and iterations of one loop run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowState {
    pub repo_path: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub test_commands: Option<Vec<String>>,
    pub test_output: Option<String>,
    pub local_all_passed: Option<bool>,
    pub passing_suites: Option<u32>,
    pub failing_suites: Option<u32>,
    pub classified_bugs: Option<Vec<ClassifiedBug>>,
    pub fix_plan: Option<Vec<FixPlanEntry>>,
    pub applied_patches: Option<Vec<AppliedPatch>>,
    pub skipped_patches: Option<Vec<SkippedPatch>>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub push_status: Option<PushStatus>,
    pub ci_run_id: Option<u64>,
    pub ci_conclusion: Option<String>,
    pub ci_run_url: Option<String>,
    pub ci_status: Option<String>,
    pub ci_no_workflow: Option<bool>,
    pub ci_logs: Option<String>,
    pub ci_passed: Option<u32>,
    pub ci_failed: Option<u32>,
    pub ci_failing_suites: Option<u32>,
    pub all_passed: Option<bool>,
    pub should_continue: Option<bool>,
    pub verdict: Option<Verdict>,
    pub improvement: Option<i64>,
    pub verification_output: Option<String>,
}

impl WorkflowState {
    /// Seed state for a run against `repo_path`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        repo_url: Option<String>,
        branch: Option<String>,
    ) -> Self {
        Self {
            repo_path: Some(repo_path.into()),
            repo_url,
            branch,
            ..Self::default()
        }
    }

    /// True when `key` holds a value.
    pub fn has(&self, key: StateKey) -> bool {
        match key {
            StateKey::RepoPath => self.repo_path.is_some(),
            StateKey::RepoUrl => self.repo_url.is_some(),
            StateKey::Branch => self.branch.is_some(),
            StateKey::TestCommands => self.test_commands.is_some(),
            StateKey::TestOutput => self.test_output.is_some(),
            StateKey::LocalAllPassed => self.local_all_passed.is_some(),
            StateKey::PassingSuites => self.passing_suites.is_some(),
            StateKey::FailingSuites => self.failing_suites.is_some(),
            StateKey::ClassifiedBugs => self.classified_bugs.is_some(),
            StateKey::FixPlan => self.fix_plan.is_some(),
            StateKey::AppliedPatches => self.applied_patches.is_some(),
            StateKey::SkippedPatches => self.skipped_patches.is_some(),
            StateKey::CommitSha => self.commit_sha.is_some(),
            StateKey::CommitMessage => self.commit_message.is_some(),
            StateKey::PushStatus => self.push_status.is_some(),
            StateKey::CiRunId => self.ci_run_id.is_some(),
            StateKey::CiConclusion => self.ci_conclusion.is_some(),
            StateKey::CiRunUrl => self.ci_run_url.is_some(),
            StateKey::CiStatus => self.ci_status.is_some(),
            StateKey::CiNoWorkflow => self.ci_no_workflow.is_some(),
            StateKey::CiLogs => self.ci_logs.is_some(),
            StateKey::CiPassed => self.ci_passed.is_some(),
            StateKey::CiFailed => self.ci_failed.is_some(),
            StateKey::CiFailingSuites => self.ci_failing_suites.is_some(),
            StateKey::AllPassed => self.all_passed.is_some(),
            StateKey::ShouldContinue => self.should_continue.is_some(),
            StateKey::Verdict => self.verdict.is_some(),
            StateKey::Improvement => self.improvement.is_some(),
            StateKey::VerificationOutput => self.verification_output.is_some(),
        }
    }

    /// Keys from `required` that hold no value, in declaration order.
    pub fn missing(&self, required: &[StateKey]) -> Vec<StateKey> {
        required
            .iter()
            .copied()
            .filter(|key| !self.has(*key))
            .collect()
    }

    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::TestCommands(v) => self.test_commands = Some(v),
            StateUpdate::TestOutput(v) => self.test_output = Some(v),
            StateUpdate::LocalAllPassed(v) => self.local_all_passed = Some(v),
            StateUpdate::PassingSuites(v) => self.passing_suites = Some(v),
            StateUpdate::FailingSuites(v) => self.failing_suites = Some(v),
            StateUpdate::ClassifiedBugs(v) => self.classified_bugs = Some(v),
            StateUpdate::FixPlan(v) => self.fix_plan = Some(v),
            StateUpdate::AppliedPatches(v) => self.applied_patches = Some(v),
            StateUpdate::SkippedPatches(v) => self.skipped_patches = Some(v),
            StateUpdate::CommitSha(v) => self.commit_sha = Some(v),
            StateUpdate::CommitMessage(v) => self.commit_message = Some(v),
            StateUpdate::PushStatus(v) => self.push_status = Some(v),
            StateUpdate::CiRunId(v) => self.ci_run_id = Some(v),
            StateUpdate::CiConclusion(v) => self.ci_conclusion = Some(v),
            StateUpdate::CiRunUrl(v) => self.ci_run_url = Some(v),
            StateUpdate::CiStatus(v) => self.ci_status = Some(v),
            StateUpdate::CiNoWorkflow(v) => self.ci_no_workflow = Some(v),
            StateUpdate::CiLogs(v) => self.ci_logs = Some(v),
            StateUpdate::CiPassed(v) => self.ci_passed = Some(v),
            StateUpdate::CiFailed(v) => self.ci_failed = Some(v),
            StateUpdate::CiFailingSuites(v) => self.ci_failing_suites = Some(v),
            StateUpdate::AllPassed(v) => self.all_passed = Some(v),
            StateUpdate::ShouldContinue(v) => self.should_continue = Some(v),
            StateUpdate::Verdict(v) => self.verdict = Some(v),
            StateUpdate::Improvement(v) => self.improvement = Some(v),
            StateUpdate::VerificationOutput(v) => self.verification_output = Some(v),
        }
    }

    pub fn apply_all(&mut self, updates: impl IntoIterator<Item = StateUpdate>) {
        for update in updates {
            self.apply(update);
        }
    }

    /// Clear everything a single iteration produces from classification
    /// through CI, so a tool that fails without outputs leaves its keys unset
    /// instead of exposing the previous iteration's values.
    pub fn reset_iteration_outputs(&mut self) {
        self.classified_bugs = None;
        self.fix_plan = None;
        self.applied_patches = None;
        self.skipped_patches = None;
        self.commit_sha = None;
        self.commit_message = None;
        self.push_status = None;
        self.ci_run_id = None;
        self.ci_conclusion = None;
        self.ci_run_url = None;
        self.ci_status = None;
        self.ci_no_workflow = None;
    }

    /// Text the classifier should read; empty when unset.
    pub fn test_output_text(&self) -> &str {
        self.test_output.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_only_has_seeded_keys() {
        let state = WorkflowState::new("/repo", Some("https://github.com/a/b".into()), None);
        assert!(state.has(StateKey::RepoPath));
        assert!(state.has(StateKey::RepoUrl));
        assert!(!state.has(StateKey::Branch));
        assert_eq!(
            state.missing(&[StateKey::RepoPath, StateKey::Branch, StateKey::TestOutput]),
            vec![StateKey::Branch, StateKey::TestOutput]
        );
    }

    #[test]
    fn apply_sets_the_matching_field() {
        let mut state = WorkflowState::default();
        let update = StateUpdate::CiConclusion("success".into());
        assert_eq!(update.key(), StateKey::CiConclusion);
        state.apply(update);
        assert_eq!(state.ci_conclusion.as_deref(), Some("success"));
        assert!(state.has(StateKey::CiConclusion));
    }

    #[test]
    fn empty_string_still_counts_as_present() {
        let mut state = WorkflowState::default();
        state.apply(StateUpdate::TestOutput(String::new()));
        assert!(state.has(StateKey::TestOutput));
        assert_eq!(state.test_output_text(), "");
    }

    #[test]
    fn reset_clears_iteration_outputs_only() {
        let mut state = WorkflowState::default();
        state.apply_all([
            StateUpdate::ClassifiedBugs(Vec::new()),
            StateUpdate::FixPlan(Vec::new()),
            StateUpdate::AppliedPatches(Vec::new()),
            StateUpdate::SkippedPatches(Vec::new()),
            StateUpdate::CommitSha("abc".into()),
            StateUpdate::CiConclusion("failure".into()),
            StateUpdate::FailingSuites(2),
            StateUpdate::CiLogs("log".into()),
        ]);
        state.reset_iteration_outputs();
        let cleared = [
            StateKey::ClassifiedBugs,
            StateKey::FixPlan,
            StateKey::AppliedPatches,
            StateKey::SkippedPatches,
            StateKey::CommitSha,
            StateKey::CiConclusion,
        ];
        assert_eq!(state.missing(&cleared), cleared);
        assert_eq!(state.failing_suites, Some(2));
        assert_eq!(state.ci_logs.as_deref(), Some("log"));
    }

    #[test]
    fn key_names_are_snake_case() {
        assert_eq!(StateKey::CiFailingSuites.to_string(), "ci_failing_suites");
        let json = serde_json::to_string(&StateKey::VerificationOutput).expect("serialize");
        assert_eq!(json, "\"verification_output\"");
    }
}
