//! `verification`: decide whether the iteration healed the repository.
//!
//! With a CI conclusion the verdict is read from CI and compared against the
//! previous failing-suite count. When CI was unavailable the suites are
//! re-run locally through the sandbox instead.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::memory::RunMemory;
use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::core::types::{CiRunStatus, Verdict};
use crate::tools::test_runner::SuiteRunner;
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

pub struct VerificationTool<'a> {
    runner: SuiteRunner<'a>,
}

impl<'a> VerificationTool<'a> {
    pub fn new(runner: SuiteRunner<'a>) -> Self {
        Self { runner }
    }

    fn verify_locally(&self, state: &WorkflowState) -> ToolResult {
        let (passed, output) = match state.repo_path.as_deref() {
            Some(repo) => {
                let commands = state.test_commands.clone().unwrap_or_default();
                match self.runner.run_or_analyze(repo, &commands) {
                    Ok(Some(run)) => (run.all_passed, run.output),
                    Ok(None) => (false, String::new()),
                    Err(err) => {
                        let chain = format!("{err:#}");
                        warn!(err = %chain, "local verification failed to run");
                        (false, String::new())
                    }
                }
            }
            None => (false, String::new()),
        };

        let (status, verdict, summary) = if passed {
            (
                ToolStatus::Success,
                Verdict::Pass,
                "CI unavailable but local tests PASS; healing verified locally.",
            )
        } else {
            (
                ToolStatus::Failure,
                Verdict::Fail,
                "CI unavailable. Local tests still FAIL; continue iterating.",
            )
        };
        info!(passed, "local verification finished");
        ToolResult::new(self.name(), status, summary).with_outputs(vec![
            StateUpdate::AllPassed(passed),
            StateUpdate::ShouldContinue(!passed),
            StateUpdate::Verdict(verdict),
            StateUpdate::Improvement(0),
            StateUpdate::VerificationOutput(output),
            StateUpdate::LocalAllPassed(passed),
            StateUpdate::FailingSuites(u32::from(!passed)),
        ])
    }
}

/// Failing-suite count of the previous iteration. A previous CI failure counts
/// as at least one failing suite even when no count was recorded.
pub fn previous_failing(state: &WorkflowState, memory: &RunMemory) -> u32 {
    let recorded = state.failing_suites.unwrap_or(0);
    let runs = memory.ci_runs();
    if recorded == 0
        && runs.len() >= 2
        && runs[runs.len() - 2].status != CiRunStatus::Success
    {
        return 1;
    }
    recorded
}

impl Tool for VerificationTool<'_> {
    fn name(&self) -> &'static str {
        "verification"
    }

    fn description(&self) -> &'static str {
        "Reads the CI conclusion, or re-runs tests locally, and returns a verdict."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::CiConclusion]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[
            StateKey::AllPassed,
            StateKey::ShouldContinue,
            StateKey::Verdict,
            StateKey::Improvement,
            StateKey::VerificationOutput,
            StateKey::FailingSuites,
            StateKey::LocalAllPassed,
        ]
    }

    #[instrument(
        skip_all,
        fields(iteration = ctx.iteration, ci_unavailable = ctx.ci_unavailable)
    )]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let conclusion = state.ci_conclusion.as_deref().unwrap_or_default();
        if ctx.ci_unavailable || conclusion.is_empty() {
            return Ok(self.verify_locally(state));
        }

        let all_passed = conclusion == "success";
        let prev = previous_failing(state, ctx.memory);
        let failing = state.ci_failing_suites.unwrap_or(u32::from(!all_passed));
        let improvement = i64::from(prev) - i64::from(failing);

        let (verdict, should_continue, summary) = if all_passed {
            let summary = "CI passed (conclusion: success). Healing complete.";
            (Verdict::Pass, false, summary.to_string())
        } else if improvement > 0 {
            let summary = format!(
                "CI failed (conclusion: {conclusion}), but improved: \
                 {failing} failing (was {prev}, fixed {improvement})."
            );
            (Verdict::Partial, true, summary)
        } else {
            let summary = format!(
                "CI failed (conclusion: {conclusion}). \
                 No improvement: {failing} failing (was {prev})."
            );
            (Verdict::Fail, failing > 0, summary)
        };
        info!(
            conclusion = %conclusion,
            verdict = %verdict,
            improvement,
            should_continue,
            "verified ci result"
        );

        let output = match state.ci_logs.as_deref() {
            Some(logs) if !logs.is_empty() => logs.to_string(),
            _ => format!("CI conclusion: {conclusion}"),
        };
        let status = if all_passed {
            ToolStatus::Success
        } else {
            ToolStatus::Failure
        };
        Ok(ToolResult::new(self.name(), status, summary).with_outputs(vec![
            StateUpdate::AllPassed(all_passed),
            StateUpdate::ShouldContinue(should_continue),
            StateUpdate::Verdict(verdict),
            StateUpdate::Improvement(improvement),
            StateUpdate::VerificationOutput(output),
            StateUpdate::FailingSuites(failing),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{ScriptedSandbox, sandbox_output};

    fn runner(sandbox: &ScriptedSandbox) -> SuiteRunner<'_> {
        SuiteRunner {
            sandbox,
            install_deps: false,
            timeout: Duration::from_secs(5),
        }
    }

    fn ci_state(conclusion: &str, failing: u32) -> WorkflowState {
        let mut state = WorkflowState::new("/repo", None, None);
        state.apply(StateUpdate::CiConclusion(conclusion.into()));
        state.apply(StateUpdate::CiFailingSuites(failing));
        state.apply(StateUpdate::CiLogs("=== test.txt ===\nlog\n".into()));
        state
    }

    fn verify(
        sandbox: &ScriptedSandbox,
        state: &WorkflowState,
        memory: &RunMemory,
        ci_unavailable: bool,
    ) -> ToolResult {
        let ctx = ToolContext {
            iteration: 2,
            max_iterations: 5,
            memory,
            ci_unavailable,
        };
        let tool = VerificationTool::new(runner(sandbox));
        tool.execute(state, &ctx).expect("execute")
    }

    #[test]
    fn ci_success_passes() {
        let sandbox = ScriptedSandbox::new(Vec::new());
        let result = verify(&sandbox, &ci_state("success", 0), &RunMemory::new(), false);
        assert_eq!(result.status, ToolStatus::Success);
        assert!(result.outputs.contains(&StateUpdate::Verdict(Verdict::Pass)));
        assert!(result.outputs.contains(&StateUpdate::ShouldContinue(false)));
        assert!(sandbox.commands().is_empty());
    }

    #[test]
    fn repeated_ci_failure_counts_previous_as_failing() {
        let sandbox = ScriptedSandbox::new(Vec::new());
        let mut memory = RunMemory::new();
        memory.append_ci_run(1, CiRunStatus::Failure, "t1");
        memory.append_ci_run(2, CiRunStatus::Failure, "t2");
        let result = verify(&sandbox, &ci_state("failure", 1), &memory, false);
        assert!(result.outputs.contains(&StateUpdate::Verdict(Verdict::Fail)));
        assert!(result.outputs.contains(&StateUpdate::Improvement(0)));
        assert!(result.outputs.contains(&StateUpdate::ShouldContinue(true)));
    }

    #[test]
    fn fewer_failing_suites_is_partial() {
        let sandbox = ScriptedSandbox::new(Vec::new());
        let mut state = ci_state("failure", 1);
        state.apply(StateUpdate::FailingSuites(3));
        let result = verify(&sandbox, &state, &RunMemory::new(), false);
        assert!(result.outputs.contains(&StateUpdate::Verdict(Verdict::Partial)));
        assert!(result.outputs.contains(&StateUpdate::Improvement(2)));
    }

    #[test]
    fn unavailable_ci_reruns_cached_commands_locally() {
        let sandbox = ScriptedSandbox::new(vec![sandbox_output(0, "2 passed", "")]);
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = WorkflowState::new(temp.path(), None, None);
        state.apply(StateUpdate::TestCommands(vec!["pytest".into()]));
        state.apply(StateUpdate::CiConclusion(String::new()));
        let result = verify(&sandbox, &state, &RunMemory::new(), true);
        assert_eq!(sandbox.commands(), ["pytest"]);
        assert!(result.outputs.contains(&StateUpdate::LocalAllPassed(true)));
        assert!(result.outputs.contains(&StateUpdate::FailingSuites(0)));
    }

    #[test]
    fn local_failure_keeps_iterating() {
        let sandbox = ScriptedSandbox::new(vec![sandbox_output(1, "1 failed", "")]);
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = WorkflowState::new(temp.path(), None, None);
        state.apply(StateUpdate::TestCommands(vec!["pytest".into()]));
        state.apply(StateUpdate::CiConclusion(String::new()));
        let result = verify(&sandbox, &state, &RunMemory::new(), false);
        assert_eq!(result.status, ToolStatus::Failure);
        assert!(result.outputs.contains(&StateUpdate::ShouldContinue(true)));
        let output = StateUpdate::VerificationOutput("1 failed\n".into());
        assert!(result.outputs.contains(&output));
    }
}
