//! The reasoning loop: drive the phase ring across iterations.
//!
//! Each iteration runs the tool bound to the current phase, applies its
//! declared outputs to the [`WorkflowState`], records what happened in the
//! [`RunMemory`], and asks [`transition`] where to go next. Iteration 1 starts
//! at `RUN_TESTS`; later iterations start at `CLASSIFY` with the previous
//! verification output as the text to classify.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetStop, Budgets};
use crate::core::memory::RunMemory;
use crate::core::phase::{Phase, PhaseOutcome, Transition, transition};
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::{BugRecord, Category, CiRunStatus, Verdict};
use crate::tools::{Registry, RegistryError, ToolContext, ToolInfo, ToolResult, ToolStatus};

/// Source of wall-clock timestamps for memory records and reports.
pub trait Clock {
    fn now(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

/// One progress notification. `tool` is `reasoning_loop` for loop-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent<'a> {
    pub tool: &'a str,
    pub status: &'a str,
    pub message: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub budgets: Budgets,
    /// Verify locally when the CI provider lists no workflow at all.
    pub local_fallback_when_no_workflow: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            local_fallback_when_no_workflow: true,
        }
    }
}

/// Snapshot of one iteration, appended once when the iteration ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub tool_results: Vec<ToolResult>,
    pub bugs_found: usize,
    pub patches_applied: usize,
    pub commit_sha: String,
    pub ci_conclusion: String,
    pub all_passed: bool,
    pub verdict: Option<Verdict>,
    pub started_at: String,
}

impl IterationReport {
    fn new(iteration: u32, started_at: String) -> Self {
        Self {
            iteration,
            tool_results: Vec::new(),
            bugs_found: 0,
            patches_applied: 0,
            commit_sha: String::new(),
            ci_conclusion: String::new(),
            all_passed: false,
            verdict: None,
            started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealStatus {
    Healed,
    Partial,
    Failed,
}

impl HealStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealStatus::Healed => "healed",
            HealStatus::Partial => "partial",
            HealStatus::Failed => "failed",
        }
    }
}

/// Aggregated result of a loop run.
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub status: HealStatus,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub total_bugs_found: usize,
    pub total_fixes_applied: usize,
    pub total_commits: u32,
    pub iterations: Vec<IterationReport>,
    pub final_test_output: String,
    pub tools: Vec<ToolInfo>,
    #[serde(skip)]
    pub memory: RunMemory,
}

enum Invocation {
    Ran(ToolResult),
    NotRun(ToolResult),
}

/// Mutable bookkeeping for one iteration.
struct IterationScope<'s> {
    iteration: u32,
    report: &'s mut IterationReport,
    ci_unavailable: bool,
}

struct Driver<'r, 't, 'c, F> {
    registry: &'r Registry<'t>,
    clock: &'c dyn Clock,
    settings: LoopSettings,
    on_progress: F,
    memory: RunMemory,
    previous_signatures: BTreeSet<(String, Category)>,
    commits: u32,
}

/// Run the reasoning loop until a terminal transition or a budget stops it.
///
/// Never fails: tool errors become `failure` results and progress callback
/// errors are logged and dropped.
#[instrument(skip_all, fields(max_iterations = settings.budgets.max_iterations))]
pub fn run_loop<F>(
    registry: &Registry<'_>,
    mut state: WorkflowState,
    settings: LoopSettings,
    clock: &dyn Clock,
    on_progress: F,
) -> LoopOutcome
where
    F: FnMut(&ProgressEvent<'_>) -> Result<()>,
{
    let mut driver = Driver {
        registry,
        clock,
        settings,
        on_progress,
        memory: RunMemory::new(),
        previous_signatures: BTreeSet::new(),
        commits: 0,
    };
    let max_iterations = settings.budgets.max_iterations;
    let tool_names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
    driver.emit(
        "reasoning_loop",
        "started",
        &format!(
            "Reasoning loop started (max {max_iterations} iterations). Tools: {}",
            tool_names.join(", ")
        ),
    );

    let mut reports: Vec<IterationReport> = Vec::new();
    let mut iteration = 0u32;
    while iteration < max_iterations {
        iteration += 1;
        driver.emit(
            "reasoning_loop",
            "running",
            &format!("Starting iteration {iteration}/{max_iterations}"),
        );
        let mut report = IterationReport::new(iteration, driver.clock.now());
        let finished = driver.run_iteration(&mut state, iteration, &mut report);
        info!(
            iteration,
            bugs = report.bugs_found,
            patches = report.patches_applied,
            verdict = ?report.verdict,
            finished,
            "iteration finished"
        );
        reports.push(report);
        if finished {
            break;
        }
        if let Some(stop) = settings.budgets.exhausted(iteration, driver.commits) {
            match stop {
                BudgetStop::Commits { used, max } => info!(used, max, "commit budget spent"),
                BudgetStop::Iterations { used, max } => info!(used, max, "iteration budget spent"),
            }
            break;
        }
    }

    let total_bugs_found: usize = reports.iter().map(|r| r.bugs_found).sum();
    let total_fixes_applied: usize = reports.iter().map(|r| r.patches_applied).sum();
    let final_passed = reports.last().is_some_and(|r| r.all_passed);
    if final_passed && total_bugs_found == 0 && total_fixes_applied == 0 && driver.commits == 0 {
        driver
            .memory
            .append_ci_run(iteration, CiRunStatus::Success, driver.clock.now());
    }
    let status = if final_passed {
        HealStatus::Healed
    } else if total_fixes_applied > 0 {
        HealStatus::Partial
    } else {
        HealStatus::Failed
    };
    driver.emit(
        "reasoning_loop",
        "completed",
        &format!(
            "Loop {}: {} iteration(s), {total_bugs_found} bug(s), {total_fixes_applied} fix(es).",
            status.as_str(),
            reports.len()
        ),
    );

    let final_test_output = state
        .verification_output
        .clone()
        .or_else(|| state.test_output.clone())
        .unwrap_or_default();
    LoopOutcome {
        status,
        iterations_used: iteration,
        max_iterations,
        total_bugs_found,
        total_fixes_applied,
        total_commits: driver.commits,
        iterations: reports,
        final_test_output,
        tools: registry.list(),
        memory: driver.memory,
    }
}

impl<F> Driver<'_, '_, '_, F>
where
    F: FnMut(&ProgressEvent<'_>) -> Result<()>,
{
    fn emit(&mut self, tool: &str, status: &str, message: &str) {
        let event = ProgressEvent { tool, status, message };
        if let Err(err) = (self.on_progress)(&event) {
            let chain = format!("{err:#}");
            warn!(tool, err = %chain, "progress callback failed");
        }
    }

    /// Run one iteration. Returns true when the loop must stop.
    fn run_iteration(
        &mut self,
        state: &mut WorkflowState,
        iteration: u32,
        report: &mut IterationReport,
    ) -> bool {
        state.reset_iteration_outputs();
        let mut scope = IterationScope {
            iteration,
            report,
            ci_unavailable: false,
        };
        let mut phase = if iteration == 1 {
            Phase::RunTests
        } else {
            Phase::Classify
        };

        loop {
            let Some(tool_name) = phase.tool_name() else {
                return true;
            };
            let outcome = match self.invoke(tool_name, state, &scope) {
                Invocation::Ran(result) => {
                    state.apply_all(result.outputs.iter().cloned());
                    scope.report.tool_results.push(result);
                    self.observe(phase, state, &mut scope)
                }
                Invocation::NotRun(result) => {
                    scope.report.tool_results.push(result);
                    PhaseOutcome::InputsMissing
                }
            };
            let next = transition(phase, &outcome);
            debug!(phase = %phase, outcome = ?outcome, next = ?next, "phase transition");
            match next {
                Transition::Advance(next_phase) => phase = next_phase,
                Transition::VerifyLocally => {
                    warn!(iteration, "ci unavailable; verifying locally");
                    scope.ci_unavailable = true;
                    state.apply(StateUpdate::CiConclusion(String::new()));
                    phase = Phase::Verify;
                }
                Transition::Continue => {
                    let feedback = if scope.ci_unavailable {
                        state.verification_output.clone()
                    } else {
                        state
                            .ci_logs
                            .clone()
                            .filter(|logs| !logs.is_empty())
                            .or_else(|| state.verification_output.clone())
                    };
                    if let Some(text) = feedback {
                        state.apply(StateUpdate::TestOutput(text));
                    }
                    return false;
                }
                Transition::Done { verdict, passed } => {
                    if verdict.is_some() {
                        scope.report.verdict = verdict;
                    }
                    scope.report.all_passed = passed;
                    return true;
                }
            }
        }
    }

    /// Invoke `name` unless its inputs are missing. Tools that did not run
    /// still leave a `skipped` or `failure` result for the report.
    fn invoke(
        &mut self,
        name: &str,
        state: &WorkflowState,
        scope: &IterationScope<'_>,
    ) -> Invocation {
        let missing = match self.registry.missing_inputs(name, state) {
            Ok(missing) => missing,
            Err(err) => {
                warn!(tool = name, err = %err, "tool lookup failed");
                return Invocation::NotRun(unavailable(name, &err));
            }
        };
        if !missing.is_empty() {
            let keys: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
            let summary = format!("Missing inputs: {}", keys.join(", "));
            warn!(tool = name, missing = %keys.join(","), "skipping tool with missing inputs");
            self.emit(name, "skipped", &summary);
            return Invocation::NotRun(ToolResult::new(name, ToolStatus::Skipped, summary));
        }

        self.emit(name, "running", "");
        let ctx = ToolContext {
            iteration: scope.iteration,
            max_iterations: self.settings.budgets.max_iterations,
            memory: &self.memory,
            ci_unavailable: scope.ci_unavailable,
        };
        match self.registry.invoke(name, state, &ctx) {
            Ok(result) => {
                let status = match result.status {
                    ToolStatus::Success => "success",
                    ToolStatus::Failure => "failure",
                    ToolStatus::Skipped => "skipped",
                };
                let summary = result.summary.clone();
                self.emit(name, status, &summary);
                Invocation::Ran(result)
            }
            Err(err) => {
                warn!(tool = name, err = %err, "tool invocation failed");
                Invocation::NotRun(unavailable(name, &err))
            }
        }
    }

    /// Condense the state after `phase` into a [`PhaseOutcome`], recording
    /// memory entries and report fields along the way.
    fn observe(
        &mut self,
        phase: Phase,
        state: &mut WorkflowState,
        scope: &mut IterationScope<'_>,
    ) -> PhaseOutcome {
        let iteration = scope.iteration;
        match phase {
            Phase::RunTests => {
                let ci_already_green = self
                    .memory
                    .latest_ci_run()
                    .is_some_and(|run| run.status == CiRunStatus::Success);
                if !ci_already_green
                    && state.local_all_passed == Some(true)
                    && let Some(logs) = state.ci_logs.clone().filter(|logs| !logs.is_empty())
                {
                    info!(iteration, "local pass; classifying ci logs");
                    state.apply(StateUpdate::TestOutput(logs));
                }
                PhaseOutcome::RunTests { ci_already_green }
            }
            Phase::Classify => {
                let bugs: Vec<BugRecord> = state
                    .classified_bugs
                    .iter()
                    .flatten()
                    .map(|classified| classified.bug.clone())
                    .collect();
                scope.report.bugs_found = bugs.len();
                if !bugs.is_empty() {
                    self.memory.append_failures(iteration, &bugs);
                }
                let signatures: BTreeSet<(String, Category)> = bugs
                    .iter()
                    .map(|bug| (bug.file.clone(), bug.category))
                    .collect();
                let stagnated = !bugs.is_empty() && signatures == self.previous_signatures;
                if stagnated {
                    info!(iteration, count = signatures.len(), "failures repeated");
                } else if !bugs.is_empty() {
                    self.previous_signatures = signatures;
                }
                PhaseOutcome::Classify {
                    bugs_found: bugs.len(),
                    local_passed: state.local_all_passed.unwrap_or(false),
                    stagnated,
                }
            }
            Phase::PlanFix => PhaseOutcome::PlanFix {
                actionable: state
                    .fix_plan
                    .iter()
                    .flatten()
                    .filter(|entry| entry.strategy.is_actionable())
                    .count(),
            },
            Phase::ApplyPatch => {
                let applied = state.applied_patches.as_ref().map_or(0, Vec::len);
                scope.report.patches_applied = applied;
                PhaseOutcome::ApplyPatch { applied }
            }
            Phase::CommitPush => {
                let sha = state.commit_sha.clone().filter(|sha| !sha.is_empty());
                if let Some(sha) = &sha {
                    scope.report.commit_sha = sha.clone();
                    let patches = state.applied_patches.as_deref().unwrap_or_default();
                    self.memory.append_fixes(iteration, patches, sha);
                    self.commits += 1;
                }
                PhaseOutcome::CommitPush {
                    committed: sha.is_some(),
                    push: state.push_status,
                }
            }
            Phase::WaitForCi => PhaseOutcome::WaitForCi {
                completed: state.ci_status.as_deref() == Some("completed"),
                no_workflow: state.ci_no_workflow.unwrap_or(false),
                local_fallback_allowed: self.settings.local_fallback_when_no_workflow,
            },
            Phase::FetchCiResults => {
                let conclusion = state.ci_conclusion.clone().unwrap_or_default();
                let status = CiRunStatus::from_conclusion(&conclusion);
                let now = self.clock.now();
                self.memory.append_ci_run(iteration, status, now);
                PhaseOutcome::FetchCiResults {
                    logs_empty: state.ci_logs.as_deref().is_none_or(str::is_empty),
                }
            }
            Phase::Verify => {
                let local_passed = state.local_all_passed.unwrap_or(false);
                scope.report.verdict = state.verdict;
                scope.report.ci_conclusion = state.ci_conclusion.clone().unwrap_or_default();
                if scope.ci_unavailable && local_passed {
                    scope.report.ci_conclusion = "local_pass".to_string();
                    self.memory
                        .append_ci_run(iteration, CiRunStatus::Success, self.clock.now());
                }
                PhaseOutcome::Verify {
                    ci_unavailable: scope.ci_unavailable,
                    local_passed,
                    all_passed: state.all_passed.unwrap_or(false),
                    should_continue: state.should_continue.unwrap_or(false),
                    at_iteration_limit: self.settings.budgets.is_last_iteration(iteration),
                    verdict: state.verdict,
                }
            }
            Phase::Done => PhaseOutcome::InputsMissing,
        }
    }
}

fn unavailable(name: &str, err: &RegistryError) -> ToolResult {
    ToolResult::new(name, ToolStatus::Failure, "Tool unavailable.").with_error(err.to_string())
}
