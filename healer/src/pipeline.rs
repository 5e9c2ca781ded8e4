//! Orchestration for `healer run`.
//!
//! Wires config and adapters into the tool registry, checks out the heal
//! branch, drives the reasoning loop, and exports the canonical result plus
//! per-iteration reports under `.healer/runs/<run_id>/`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::branch::branch_name;
use crate::core::result::{ResultDocument, RunIdentity, build_result};
use crate::core::state::WorkflowState;
use crate::io::config::{CONFIG_FILE, HEALER_DIR, HealerConfig, Secrets};
use crate::io::git::{Git, GitCli, Vcs};
use crate::io::github::{CiProvider, GithubClient};
use crate::io::iteration_log::{RunPaths, write_run};
use crate::io::llm::{ModelClient, OpenAiCompatClient};
use crate::io::retry::{Sleeper, ThreadSleeper};
use crate::io::sandbox::{SandboxExecutor, select_sandbox};
use crate::looping::{Clock, LoopOutcome, LoopSettings, ProgressEvent, SystemClock, run_loop};
use crate::tools::Registry;
use crate::tools::ci_fetch::FetchCiResultsTool;
use crate::tools::ci_wait::{PollSchedule, WaitForCiTool};
use crate::tools::classifier::ClassifierTool;
use crate::tools::commit::CommitTool;
use crate::tools::patcher::PatcherTool;
use crate::tools::planner::PlannerTool;
use crate::tools::test_runner::{SuiteRunner, TestRunnerTool};
use crate::tools::verification::VerificationTool;

/// What one `healer run` invocation was asked to heal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub repo: PathBuf,
    pub repo_url: String,
    pub team: String,
    pub leader: String,
    pub run_id: String,
    pub push: bool,
}

/// Borrowed collaborators the tools run against.
#[derive(Clone, Copy)]
pub struct Adapters<'a> {
    pub sandbox: &'a dyn SandboxExecutor,
    pub model: Option<&'a dyn ModelClient>,
    pub ci: &'a dyn CiProvider,
    pub vcs: &'a dyn Vcs,
    pub sleeper: &'a dyn Sleeper,
    pub clock: &'a dyn Clock,
}

#[derive(Debug)]
pub struct HealReport {
    pub branch: String,
    pub outcome: LoopOutcome,
    pub result: ResultDocument,
    pub paths: RunPaths,
}

/// Register the eight phase tools in ring order.
pub fn build_registry<'a>(
    cfg: &HealerConfig,
    adapters: &Adapters<'a>,
    push: bool,
) -> Result<Registry<'a>> {
    let runner = SuiteRunner {
        sandbox: adapters.sandbox,
        install_deps: cfg.sandbox.install_deps,
        timeout: cfg.sandbox.timeout(),
    };
    let schedule = PollSchedule {
        interval: Duration::from_secs(cfg.ci.poll_interval_secs),
        max_wait: Duration::from_secs(cfg.ci.max_wait_secs),
        no_workflow_bail: cfg.ci.no_workflow_bail_polls,
    };

    let mut registry = Registry::new();
    registry.register(Box::new(TestRunnerTool::new(runner)))?;
    registry.register(Box::new(ClassifierTool::new(adapters.model)))?;
    registry.register(Box::new(PlannerTool))?;
    registry.register(Box::new(PatcherTool::new(adapters.model, cfg.patch.max_changed_lines)))?;
    registry.register(Box::new(CommitTool::new(adapters.vcs, push)))?;
    registry.register(Box::new(WaitForCiTool::new(adapters.ci, adapters.sleeper, schedule)))?;
    registry.register(Box::new(FetchCiResultsTool::new(adapters.ci)))?;
    registry.register(Box::new(VerificationTool::new(runner)))?;
    Ok(registry)
}

/// Heal `request.repo` with the given adapters and write the run artifacts.
#[instrument(skip_all, fields(run_id = %request.run_id, repo = %request.repo.display()))]
pub fn heal<F>(
    cfg: &HealerConfig,
    request: &RunRequest,
    adapters: &Adapters<'_>,
    on_progress: F,
) -> Result<HealReport>
where
    F: FnMut(&ProgressEvent<'_>) -> Result<()>,
{
    let started = Instant::now();
    let repo = request
        .repo
        .canonicalize()
        .with_context(|| format!("resolve repo path {}", request.repo.display()))?;
    let branch = branch_name(&request.team, &request.leader);
    Git::new(&repo)
        .ensure_branch(&branch)
        .with_context(|| format!("check out {branch}"))?;
    info!(
        branch = %branch,
        sandbox = adapters.sandbox.name(),
        model = adapters.model.is_some(),
        "healing"
    );

    let registry = build_registry(cfg, adapters, request.push)?;
    let url = Some(request.repo_url.clone());
    let state = WorkflowState::new(repo.clone(), url, Some(branch.clone()));
    let settings = LoopSettings {
        budgets: cfg.budgets(),
        local_fallback_when_no_workflow: cfg.ci.local_fallback_when_no_workflow,
    };
    let outcome = run_loop(&registry, state, settings, adapters.clock, on_progress);

    let identity = RunIdentity {
        repository_url: request.repo_url.clone(),
        branch: branch.clone(),
        team_name: request.team.clone(),
        leader_name: request.leader.clone(),
        runtime_seconds: started.elapsed().as_secs_f64(),
        generated_at: adapters.clock.now(),
    };
    let result = build_result(&outcome.memory, &identity, &cfg.score_rules());
    let paths = write_run(&repo, &request.run_id, &outcome.iterations, &result)?;
    info!(
        status = outcome.status.as_str(),
        iterations = outcome.iterations_used,
        commits = outcome.total_commits,
        result = %paths.result_path.display(),
        "run finished"
    );

    Ok(HealReport {
        branch,
        outcome,
        result,
        paths,
    })
}

/// Build the production adapters from `cfg` and the environment, then heal.
pub fn run_pipeline(cfg: &HealerConfig, request: &RunRequest) -> Result<HealReport> {
    let secrets = Secrets::from_env(cfg);
    let sandbox = select_sandbox(&cfg.sandbox);
    let model = match &secrets.model_api_key {
        Some(key) => Some(OpenAiCompatClient::new(&cfg.model, key.clone())?),
        None => {
            warn!(env = %cfg.model.api_key_env, "no model api key; model layers disabled");
            None
        }
    };
    if secrets.ci_token.is_none() {
        warn!(env = %cfg.ci.token_env, "no ci token; using unauthenticated api calls");
    }
    let ci = GithubClient::new(&cfg.ci, secrets.ci_token.clone())?;
    let adapters = Adapters {
        sandbox: sandbox.as_ref(),
        model: model.as_ref().map(|client| client as &dyn ModelClient),
        ci: &ci,
        vcs: &GitCli,
        sleeper: &ThreadSleeper,
        clock: &SystemClock,
    };
    heal(cfg, request, &adapters, log_progress)
}

fn log_progress(event: &ProgressEvent<'_>) -> Result<()> {
    info!(
        tool = event.tool,
        status = event.status,
        "{}",
        event.message
    );
    Ok(())
}

/// Run id derived from the current UTC time.
pub fn generate_run_id() -> String {
    format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"))
}

/// Default config location relative to `root`.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(HEALER_DIR).join(CONFIG_FILE)
}
