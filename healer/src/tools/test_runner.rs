//! `test_runner`: discover and run the repository's test suites.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::io::discovery::discover;
use crate::io::sandbox::{SandboxExecutor, SandboxRequest, run_or_degrade};
use crate::io::static_analysis::analyze;
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

const STDERR_SEPARATOR: &str = "\n--- STDERR ---\n";

/// Combined result of running every suite (or the static fallback) once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteRun {
    pub output: String,
    pub passing: u32,
    pub failing: u32,
    pub all_passed: bool,
    /// True when no suites existed and static analysis stood in for them.
    pub static_fallback: bool,
}

/// How suites are executed; shared with the verification tool.
#[derive(Clone, Copy)]
pub struct SuiteRunner<'a> {
    pub sandbox: &'a dyn SandboxExecutor,
    pub install_deps: bool,
    pub timeout: Duration,
}

impl SuiteRunner<'_> {
    /// Run each command through the sandbox. Stdouts come first, then the
    /// stderrs under a separator when any of them is non-blank.
    pub fn run_commands(&self, repo: &Path, commands: &[String]) -> SuiteRun {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut max_exit = 0;
        let (mut passing, mut failing) = (0, 0);
        for command in commands {
            info!(command = %command, sandbox = self.sandbox.name(), "running test suite");
            let output = run_or_degrade(
                self.sandbox,
                &SandboxRequest {
                    repo_path: repo.to_path_buf(),
                    command: command.clone(),
                    install_deps: self.install_deps,
                    timeout: self.timeout,
                },
            );
            stdout.push_str(&output.stdout);
            stdout.push('\n');
            stderr.push_str(&output.stderr);
            stderr.push('\n');
            max_exit = max_exit.max(output.exit_code);
            if output.passed() {
                passing += 1;
            } else {
                failing += 1;
            }
        }
        if !stderr.trim().is_empty() {
            stdout.push_str(STDERR_SEPARATOR);
            stdout.push_str(&stderr);
        }
        SuiteRun {
            output: stdout,
            passing,
            failing,
            all_passed: max_exit == 0 && failing == 0,
            static_fallback: false,
        }
    }

    /// Run `commands`, or static analysis when there are none. `None` means
    /// there was nothing to check at all.
    pub fn run_or_analyze(&self, repo: &Path, commands: &[String]) -> Result<Option<SuiteRun>> {
        if !commands.is_empty() {
            return Ok(Some(self.run_commands(repo, commands)));
        }
        let report = analyze(repo, self.sandbox, self.timeout).context("static analysis fallback")?;
        Ok(report.map(|report| SuiteRun {
            all_passed: report.all_passed(),
            output: report.output,
            passing: report.passes,
            failing: report.errors,
            static_fallback: true,
        }))
    }
}

pub struct TestRunnerTool<'a> {
    runner: SuiteRunner<'a>,
}

impl<'a> TestRunnerTool<'a> {
    pub fn new(runner: SuiteRunner<'a>) -> Self {
        Self { runner }
    }
}

impl Tool for TestRunnerTool<'_> {
    fn name(&self) -> &'static str {
        "test_runner"
    }

    fn description(&self) -> &'static str {
        "Discovers test frameworks and runs every suite in the sandbox."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::RepoPath]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[
            StateKey::TestOutput,
            StateKey::LocalAllPassed,
            StateKey::TestCommands,
            StateKey::PassingSuites,
            StateKey::FailingSuites,
        ]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let Some(repo) = state.repo_path.as_deref() else {
            return Ok(ToolResult::new(self.name(), ToolStatus::Skipped, "No repository path."));
        };
        let commands = match &state.test_commands {
            Some(cached) if !cached.is_empty() => cached.clone(),
            _ => discover(repo)?.commands,
        };

        let Some(run) = self.runner.run_or_analyze(repo, &commands)? else {
            let summary = "No test framework or source files detected.";
            return Ok(ToolResult::new(self.name(), ToolStatus::Skipped, summary)
                .with_outputs(vec![
                    StateUpdate::TestOutput(String::new()),
                    StateUpdate::LocalAllPassed(false),
                    StateUpdate::TestCommands(Vec::new()),
                    StateUpdate::PassingSuites(0),
                    StateUpdate::FailingSuites(0),
                ]));
        };

        let summary = if run.static_fallback {
            format!(
                "Static analysis: {} passed, {} failed.",
                run.passing, run.failing
            )
        } else {
            format!(
                "Ran {} suite(s): {} passed, {} failed.",
                commands.len(),
                run.passing,
                run.failing
            )
        };
        let status = if run.all_passed {
            ToolStatus::Success
        } else {
            ToolStatus::Failure
        };
        Ok(ToolResult::new(self.name(), status, summary).with_outputs(vec![
            StateUpdate::TestOutput(run.output),
            StateUpdate::LocalAllPassed(run.all_passed),
            StateUpdate::TestCommands(commands),
            StateUpdate::PassingSuites(run.passing),
            StateUpdate::FailingSuites(run.failing),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::RunMemory;
    use crate::test_support::{ScriptedSandbox, sandbox_output};

    fn ctx(memory: &RunMemory) -> ToolContext<'_> {
        ToolContext {
            iteration: 1,
            max_iterations: 5,
            memory,
            ci_unavailable: false,
        }
    }

    #[test]
    fn cached_commands_run_in_order_and_join_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = ScriptedSandbox::new(vec![
            sandbox_output(0, "1 passed", ""),
            sandbox_output(1, "1 failed", "boom"),
        ]);
        let tool = TestRunnerTool::new(SuiteRunner {
            sandbox: &sandbox,
            install_deps: false,
            timeout: Duration::from_secs(5),
        });
        let mut state = WorkflowState::new(temp.path(), None, None);
        state.apply(StateUpdate::TestCommands(vec!["pytest".into(), "npm test".into()]));
        let memory = RunMemory::new();

        let result = tool.execute(&state, &ctx(&memory)).expect("execute");

        assert_eq!(result.status, ToolStatus::Failure);
        assert_eq!(result.summary, "Ran 2 suite(s): 1 passed, 1 failed.");
        assert_eq!(sandbox.commands(), ["pytest", "npm test"]);
        assert!(result.outputs.contains(&StateUpdate::TestOutput(
            "1 passed\n1 failed\n\n--- STDERR ---\n\nboom\n".into()
        )));
        assert!(result.outputs.contains(&StateUpdate::LocalAllPassed(false)));
        assert!(result.outputs.contains(&StateUpdate::FailingSuites(1)));
    }

    #[test]
    fn empty_repository_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = ScriptedSandbox::new(Vec::new());
        let tool = TestRunnerTool::new(SuiteRunner {
            sandbox: &sandbox,
            install_deps: false,
            timeout: Duration::from_secs(5),
        });
        let memory = RunMemory::new();
        let result = tool
            .execute(&WorkflowState::new(temp.path(), None, None), &ctx(&memory))
            .expect("execute");
        assert_eq!(result.status, ToolStatus::Skipped);
        assert!(sandbox.commands().is_empty());
    }

    #[test]
    fn discovered_pytest_is_cached() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("conftest.py"), "").expect("write");
        let body = "def test_x():\n    pass\n";
        std::fs::write(temp.path().join("test_calc.py"), body).expect("write");
        let sandbox = ScriptedSandbox::new(vec![sandbox_output(0, "1 passed", "")]);
        let tool = TestRunnerTool::new(SuiteRunner {
            sandbox: &sandbox,
            install_deps: true,
            timeout: Duration::from_secs(5),
        });
        let memory = RunMemory::new();
        let result = tool
            .execute(&WorkflowState::new(temp.path(), None, None), &ctx(&memory))
            .expect("execute");
        assert_eq!(result.status, ToolStatus::Success);
        assert!(result.outputs.contains(&StateUpdate::TestCommands(vec!["pytest".into()])));
        assert!(result.outputs.contains(&StateUpdate::TestOutput("1 passed\n".into())));
    }
}
