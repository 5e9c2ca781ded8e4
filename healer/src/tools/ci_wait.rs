//! `wait_for_ci`: poll the CI provider until the pushed commit's run completes.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::io::github::{CiProvider, RepoSlug, WorkflowRun, pick_run};
use crate::io::retry::Sleeper;
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

/// Polling budget for one CI wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Consecutive empty listings after which the repository is assumed to
    /// have no workflow at all.
    pub no_workflow_bail: u32,
}

impl PollSchedule {
    /// Number of polls that fit in `max_wait`; at least one.
    pub fn max_polls(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let polls = self.max_wait.as_secs_f64() / self.interval.as_secs_f64();
        (polls.floor() as u32).max(1)
    }
}

/// How a poll sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(WorkflowRun),
    /// A run exists but never reached `completed`.
    TimedOut(WorkflowRun),
    NoWorkflow { polls: u32 },
}

/// Poll `ci` on `schedule`. Listing errors are logged and count as a poll.
pub fn poll_until_complete(
    ci: &dyn CiProvider,
    sleeper: &dyn Sleeper,
    schedule: &PollSchedule,
    slug: &RepoSlug,
    branch: &str,
    commit_sha: &str,
) -> PollOutcome {
    let max_polls = schedule.max_polls();
    let mut latest: Option<WorkflowRun> = None;
    let mut empty_streak = 0u32;
    let mut polls = 0u32;

    while polls < max_polls {
        polls += 1;
        match ci.list_runs(slug, branch) {
            Ok(runs) if runs.is_empty() => {
                empty_streak += 1;
                warn!(
                    poll = polls,
                    empty_streak,
                    bail = schedule.no_workflow_bail,
                    "no workflow runs listed"
                );
                if empty_streak >= schedule.no_workflow_bail {
                    break;
                }
            }
            Ok(runs) => {
                empty_streak = 0;
                if let Some(run) = pick_run(&runs, commit_sha) {
                    debug!(run_id = run.id, status = %run.status, "tracking workflow run");
                    if run.is_completed() {
                        return PollOutcome::Completed(run.clone());
                    }
                    latest = Some(run.clone());
                }
            }
            Err(err) => {
                let chain = format!("{err:#}");
                warn!(poll = polls, err = %chain, "ci api error");
            }
        }
        if polls < max_polls {
            sleeper.sleep(schedule.interval);
        }
    }

    match latest {
        Some(run) => PollOutcome::TimedOut(run),
        None => PollOutcome::NoWorkflow { polls },
    }
}

pub struct WaitForCiTool<'a> {
    ci: &'a dyn CiProvider,
    sleeper: &'a dyn Sleeper,
    schedule: PollSchedule,
}

impl<'a> WaitForCiTool<'a> {
    pub fn new(ci: &'a dyn CiProvider, sleeper: &'a dyn Sleeper, schedule: PollSchedule) -> Self {
        Self { ci, sleeper, schedule }
    }

    fn no_run(&self, summary: String, error: &str) -> ToolResult {
        ToolResult::new(self.name(), ToolStatus::Failure, summary)
            .with_outputs(vec![
                StateUpdate::CiRunId(0),
                StateUpdate::CiConclusion(String::new()),
                StateUpdate::CiRunUrl(String::new()),
                StateUpdate::CiStatus(String::new()),
                StateUpdate::CiNoWorkflow(true),
            ])
            .with_error(error)
    }
}

impl Tool for WaitForCiTool<'_> {
    fn name(&self) -> &'static str {
        "wait_for_ci"
    }

    fn description(&self) -> &'static str {
        "Polls the CI provider until the pushed commit's workflow run completes."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::RepoUrl, StateKey::Branch, StateKey::CommitSha]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[
            StateKey::CiRunId,
            StateKey::CiConclusion,
            StateKey::CiRunUrl,
            StateKey::CiStatus,
            StateKey::CiNoWorkflow,
        ]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let repo_url = state.repo_url.as_deref().unwrap_or_default();
        let branch = state.branch.as_deref().unwrap_or_default();
        let commit_sha = state.commit_sha.as_deref().unwrap_or_default();
        let Some(slug) = RepoSlug::parse(repo_url) else {
            let summary = format!("Cannot parse owner/repo from: {repo_url}");
            return Ok(ToolResult::new(self.name(), ToolStatus::Failure, summary)
                .with_outputs(vec![StateUpdate::CiStatus(String::new())])
                .with_error("repository URL is not a GitHub URL"));
        };

        info!(owner = %slug.owner, repo = %slug.repo, branch = %branch, "waiting for ci");
        let outcome = poll_until_complete(
            self.ci,
            self.sleeper,
            &self.schedule,
            &slug,
            branch,
            commit_sha,
        );
        match outcome {
            PollOutcome::Completed(run) => {
                let conclusion = run
                    .conclusion
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                info!(run_id = run.id, conclusion = %conclusion, "ci run completed");
                Ok(ToolResult::new(
                    self.name(),
                    ToolStatus::Success,
                    format!("CI run #{} completed: {conclusion}.", run.id),
                )
                .with_outputs(vec![
                    StateUpdate::CiRunId(run.id),
                    StateUpdate::CiConclusion(conclusion),
                    StateUpdate::CiRunUrl(run.html_url),
                    StateUpdate::CiStatus("completed".to_string()),
                    StateUpdate::CiNoWorkflow(false),
                ]))
            }
            PollOutcome::TimedOut(run) => {
                warn!(run_id = run.id, status = %run.status, "ci run did not complete in time");
                Ok(ToolResult::new(
                    self.name(),
                    ToolStatus::Failure,
                    format!(
                        "CI timed out after {}s (status: {}).",
                        self.schedule.max_wait.as_secs(),
                        run.status
                    ),
                )
                .with_outputs(vec![
                    StateUpdate::CiRunId(run.id),
                    StateUpdate::CiConclusion("timeout".to_string()),
                    StateUpdate::CiRunUrl(run.html_url),
                    StateUpdate::CiStatus(run.status),
                    StateUpdate::CiNoWorkflow(false),
                ])
                .with_error("workflow did not complete within timeout"))
            }
            PollOutcome::NoWorkflow { polls } => {
                warn!(polls, branch = %branch, "no ci run found");
                Ok(self.no_run(
                    format!("No CI run found for {branch} after {polls} poll(s)."),
                    "no matching workflow run found",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::RunMemory;
    use crate::test_support::{NoSleep, ScriptedCi, workflow_run};

    fn schedule() -> PollSchedule {
        PollSchedule {
            interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(60),
            no_workflow_bail: 3,
        }
    }

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new(
            "/repo",
            Some("https://github.com/acme/widgets".into()),
            Some("ACME_ALICE_AI_Fix".into()),
        );
        state.apply(StateUpdate::CommitSha("abc1234".into()));
        state
    }

    fn run(tool: &WaitForCiTool<'_>) -> ToolResult {
        let memory = RunMemory::new();
        let ctx = ToolContext {
            iteration: 1,
            max_iterations: 5,
            memory: &memory,
            ci_unavailable: false,
        };
        tool.execute(&state(), &ctx).expect("execute")
    }

    #[test]
    fn max_polls_is_wait_over_interval() {
        assert_eq!(schedule().max_polls(), 4);
        let tight = PollSchedule {
            max_wait: Duration::from_secs(5),
            ..schedule()
        };
        assert_eq!(tight.max_polls(), 1);
    }

    #[test]
    fn completes_on_matching_run() {
        let ci = ScriptedCi::new(vec![
            Ok(vec![workflow_run(7, "abc1234ffff", "in_progress", None)]),
            Ok(vec![
                workflow_run(8, "0000000", "completed", Some("success")),
                workflow_run(7, "abc1234ffff", "completed", Some("failure")),
            ]),
        ]);
        let sleeper = NoSleep::default();
        let result = run(&WaitForCiTool::new(&ci, &sleeper, schedule()));
        assert_eq!(result.status, ToolStatus::Success);
        assert!(result.outputs.contains(&StateUpdate::CiRunId(7)));
        assert!(result.outputs.contains(&StateUpdate::CiConclusion("failure".into())));
        assert_eq!(sleeper.count(), 1);
    }

    #[test]
    fn bails_after_consecutive_empty_polls() {
        let ci = ScriptedCi::new(vec![Ok(Vec::new())]);
        let sleeper = NoSleep::default();
        let result = run(&WaitForCiTool::new(&ci, &sleeper, schedule()));
        assert_eq!(result.status, ToolStatus::Failure);
        assert!(result.outputs.contains(&StateUpdate::CiNoWorkflow(true)));
        assert!(result.outputs.contains(&StateUpdate::CiStatus(String::new())));
        assert_eq!(ci.list_calls(), 3);
    }

    #[test]
    fn unfinished_run_times_out() {
        let ci = ScriptedCi::new(vec![Ok(vec![workflow_run(9, "abc1234", "queued", None)])]);
        let sleeper = NoSleep::default();
        let result = run(&WaitForCiTool::new(&ci, &sleeper, schedule()));
        assert_eq!(result.status, ToolStatus::Failure);
        assert!(result.outputs.contains(&StateUpdate::CiConclusion("timeout".into())));
        assert!(result.outputs.contains(&StateUpdate::CiStatus("queued".into())));
        assert_eq!(ci.list_calls(), 4);
        assert_eq!(sleeper.count(), 3);
    }

    #[test]
    fn api_errors_keep_polling() {
        let ci = ScriptedCi::new(vec![
            Err("502 bad gateway".to_string()),
            Ok(vec![workflow_run(3, "abc1234", "completed", Some("success"))]),
        ]);
        let sleeper = NoSleep::default();
        let result = run(&WaitForCiTool::new(&ci, &sleeper, schedule()));
        assert_eq!(result.status, ToolStatus::Success);
        assert!(result.outputs.contains(&StateUpdate::CiStatus("completed".into())));
    }
}
