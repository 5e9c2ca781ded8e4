//! End-to-end `heal` scenarios with scripted sandbox, CI, and VCS adapters.
//!
//! Each scenario seeds a temporary git repository, scripts what the test
//! suite and CI report, and checks the loop outcome, the working tree, and
//! the canonical result document.

use std::fs;

use healer::core::result::{CiLabel, FixStatus};
use healer::core::types::Verdict;
use healer::io::config::HealerConfig;
use healer::io::github::WorkflowRun;
use healer::io::sandbox::SandboxOutput;
use healer::looping::HealStatus;
use healer::pipeline::{Adapters, HealReport, RunRequest, heal};
use healer::test_support::{
    FixedClock, NoSleep, ScriptedCi, ScriptedSandbox, ScriptedVcs, TestRepo, sandbox_output,
    workflow_run,
};

const PYTEST_INI: &str = "[pytest]\ntestpaths = tests\n";
const TEST_FILE: &str = "from src.app import add\n\n\ndef test_add():\n    assert add(1, 2) == 3\n";

fn missing_colon_log(file: &str, line: u32, code: &str) -> String {
    format!("  File \"{file}\", line {line}\n    {code}\n    ^\nSyntaxError: expected ':'\n")
}

fn failing(log: &str) -> SandboxOutput {
    sandbox_output(2, log, "")
}

fn app_missing_colon() -> SandboxOutput {
    failing(&missing_colon_log("src/app.py", 1, "def add(a, b)"))
}

fn passing() -> SandboxOutput {
    sandbox_output(0, "1 passed in 0.01s", "")
}

fn single_colon_repo() -> TestRepo {
    TestRepo::with_files(&[
        ("pytest.ini", PYTEST_INI),
        ("src/app.py", "def add(a, b)\n    return a + b\n"),
        ("tests/test_app.py", TEST_FILE),
    ])
    .expect("repo")
}

fn request(repo: &TestRepo, push: bool) -> RunRequest {
    RunRequest {
        repo: repo.path().to_path_buf(),
        repo_url: "https://github.com/acme/widgets".to_string(),
        team: "Code Warriors".to_string(),
        leader: "Jane Doe".to_string(),
        run_id: "run-test".to_string(),
        push,
    }
}

struct Scripted {
    sandbox: ScriptedSandbox,
    ci: ScriptedCi,
    vcs: ScriptedVcs,
    sleeper: NoSleep,
}

impl Scripted {
    fn new(sandbox: Vec<SandboxOutput>, ci: ScriptedCi) -> Self {
        Self {
            sandbox: ScriptedSandbox::new(sandbox),
            ci,
            vcs: ScriptedVcs::new(),
            sleeper: NoSleep::default(),
        }
    }

    fn with_vcs(mut self, vcs: ScriptedVcs) -> Self {
        self.vcs = vcs;
        self
    }

    fn heal(&self, cfg: &HealerConfig, request: &RunRequest) -> HealReport {
        let adapters = Adapters {
            sandbox: &self.sandbox,
            model: None,
            ci: &self.ci,
            vcs: &self.vcs,
            sleeper: &self.sleeper,
            clock: &FixedClock,
        };
        heal(cfg, request, &adapters, |_| Ok(())).expect("heal")
    }
}

fn green_ci_for(shas: &[&str]) -> ScriptedCi {
    let runs: Vec<WorkflowRun> = shas
        .iter()
        .enumerate()
        .map(|(i, sha)| workflow_run(100 + i as u64, sha, "completed", Some("success")))
        .collect();
    let logs = b"tests/test_app.py::test_add PASSED\n1 passed in 0.02s\n".to_vec();
    ScriptedCi::new(vec![Ok(runs)]).with_logs(Ok(logs))
}

#[test]
fn single_missing_colon_heals_with_one_commit() {
    let repo = single_colon_repo();
    let scripted = Scripted::new(vec![app_missing_colon()], green_ci_for(&["c000001"]));

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    assert_eq!(report.outcome.status, HealStatus::Healed);
    assert!(report.outcome.iterations_used <= 2);
    assert!(report.outcome.total_commits <= 2);
    assert_eq!(report.branch, "CODE_WARRIORS_JANE_DOE_AI_Fix");
    assert_eq!(
        repo.read("src/app.py").expect("read"),
        "def add(a, b):\n    return a + b\n"
    );
    assert_eq!(repo.read("tests/test_app.py").expect("read"), TEST_FILE);
    assert_eq!(scripted.vcs.pushes(), ["CODE_WARRIORS_JANE_DOE_AI_Fix"]);

    let result = &report.result;
    assert_eq!(result.final_ci_status, CiLabel::Passed);
    assert_eq!(result.total_failures_detected, 1);
    assert_eq!(result.total_fixes_applied, 1);
    assert_eq!(
        result.failures_detected[0].description,
        "src/app.py — Line 1: SyntaxError: expected ':'"
    );
    let fix = &result.fixes[0];
    assert_eq!(fix.file, "src/app.py");
    assert_eq!(fix.bug_type, "SYNTAX");
    assert_eq!(fix.status, FixStatus::Verified);
    assert!(fix.commit_message.starts_with("[AI-AGENT] "));
    assert!(fix.description.starts_with("SYNTAX error in src/app.py line 1 → Fix: [AI-AGENT] "));
    assert_eq!(result.score.total_commits, 1);
    assert_eq!(result.score.final_score, 110);
}

#[test]
fn three_files_are_fixed_in_one_apply_patch_call() {
    let repo = TestRepo::with_files(&[
        ("pytest.ini", PYTEST_INI),
        ("src/a.py", "def a()\n    return 1\n"),
        ("src/b.py", "def b()\n    return 2\n"),
        ("src/c.py", "def c()\n    return 3\n"),
    ])
    .expect("repo");
    let log = [
        missing_colon_log("src/a.py", 1, "def a()"),
        missing_colon_log("src/b.py", 1, "def b()"),
        missing_colon_log("src/c.py", 1, "def c()"),
    ]
    .join("\n");
    let scripted = Scripted::new(vec![failing(&log)], green_ci_for(&["c000001"]));

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    assert_eq!(report.outcome.status, HealStatus::Healed);
    assert_eq!(report.outcome.iterations_used, 1);
    assert_eq!(report.outcome.iterations[0].patches_applied, 3);
    assert_eq!(report.outcome.total_commits, 1);
    for (file, name) in [("src/a.py", "a"), ("src/b.py", "b"), ("src/c.py", "c")] {
        let text = repo.read(file).expect("read");
        let header = format!("def {name}():\n");
        assert!(text.starts_with(&header), "{file}: {text}");
    }
    let messages = scripted.vcs.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("[AI-AGENT] Iteration 1: 3 fix(es) applied"));
}

#[test]
fn repeated_failure_signature_stops_without_new_patches() {
    let repo = single_colon_repo();
    let log = missing_colon_log("src/app.py", 1, "def add(a, b)");
    let runs = vec![workflow_run(7, "c000001", "completed", Some("failure"))];
    let ci = ScriptedCi::new(vec![Ok(runs)]).with_logs(Ok(log.clone().into_bytes()));
    let scripted = Scripted::new(vec![failing(&log)], ci);

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    assert_eq!(report.outcome.iterations_used, 2);
    let second = &report.outcome.iterations[1];
    assert_eq!(second.patches_applied, 0);
    assert_eq!(second.verdict, Some(Verdict::NoNewFailures));
    assert_eq!(report.outcome.status, HealStatus::Partial);
    assert_eq!(scripted.vcs.messages().len(), 1);
    assert_eq!(report.result.final_ci_status, CiLabel::Failed);
    assert_eq!(report.result.fixes[0].status, FixStatus::Applied);
}

/// CI keeps failing on a new file each time so the loop never stagnates.
fn ever_failing_ci() -> ScriptedCi {
    ScriptedCi::new(vec![Ok(vec![
        workflow_run(1, "c000001", "completed", Some("failure")),
        workflow_run(2, "c000002", "completed", Some("failure")),
        workflow_run(3, "c000003", "completed", Some("failure")),
    ])])
    .with_logs(Ok(missing_colon_log("src/b.py", 1, "def b()").into_bytes()))
    .with_logs(Ok(missing_colon_log("src/c.py", 1, "def c()").into_bytes()))
    .with_logs(Ok(missing_colon_log("src/d.py", 1, "def d()").into_bytes()))
}

fn four_file_repo() -> TestRepo {
    TestRepo::with_files(&[
        ("pytest.ini", PYTEST_INI),
        ("src/a.py", "def a()\n    return 1\n"),
        ("src/b.py", "def b()\n    return 2\n"),
        ("src/c.py", "def c()\n    return 3\n"),
        ("src/d.py", "def d()\n    return 4\n"),
    ])
    .expect("repo")
}

#[test]
fn iteration_budget_caps_the_run() {
    let repo = four_file_repo();
    let scripted = Scripted::new(
        vec![failing(&missing_colon_log("src/a.py", 1, "def a()"))],
        ever_failing_ci(),
    );
    let mut cfg = HealerConfig::default();
    cfg.loop_.max_iterations = 2;

    let report = scripted.heal(&cfg, &request(&repo, true));

    assert_eq!(report.outcome.iterations_used, 2);
    assert_eq!(report.outcome.iterations.len(), 2);
    assert_eq!(report.outcome.total_commits, 2);
    assert_eq!(report.outcome.status, HealStatus::Partial);
    let untouched = repo.read("src/c.py").expect("read");
    assert_eq!(untouched, "def c()\n    return 3\n");
}

#[test]
fn commit_budget_caps_the_run() {
    let repo = four_file_repo();
    let scripted = Scripted::new(
        vec![failing(&missing_colon_log("src/a.py", 1, "def a()"))],
        ever_failing_ci(),
    );
    let mut cfg = HealerConfig::default();
    cfg.loop_.max_commits = 1;

    let report = scripted.heal(&cfg, &request(&repo, true));

    assert_eq!(report.outcome.iterations_used, 1);
    assert_eq!(report.outcome.total_commits, 1);
    assert_eq!(scripted.vcs.messages().len(), 1);
    assert_eq!(report.result.score.total_commits, 1);
}

#[test]
fn no_push_verifies_locally() {
    let repo = single_colon_repo();
    let scripted = Scripted::new(
        vec![app_missing_colon(), passing()],
        ScriptedCi::new(Vec::new()),
    );

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, false));

    assert_eq!(report.outcome.status, HealStatus::Healed);
    let first = &report.outcome.iterations[0];
    assert_eq!(first.verdict, Some(Verdict::PassLocal));
    assert_eq!(first.ci_conclusion, "local_pass");
    assert_eq!(scripted.ci.list_calls(), 0);
    assert!(scripted.vcs.pushes().is_empty());
    assert_eq!(scripted.sandbox.commands().len(), 2);
    assert_eq!(report.result.final_ci_status, CiLabel::Passed);
}

#[test]
fn missing_workflow_without_fallback_is_not_healed() {
    let repo = single_colon_repo();
    let scripted = Scripted::new(
        vec![app_missing_colon(), passing()],
        ScriptedCi::new(vec![Ok(Vec::new())]),
    );
    let mut cfg = HealerConfig::default();
    cfg.ci.local_fallback_when_no_workflow = false;

    let report = scripted.heal(&cfg, &request(&repo, true));

    let first = &report.outcome.iterations[0];
    assert_eq!(first.verdict, Some(Verdict::CiNotConfigured));
    assert_eq!(report.outcome.status, HealStatus::Partial);
    assert_eq!(scripted.ci.list_calls(), cfg.ci.no_workflow_bail_polls);
    assert_eq!(scripted.sandbox.commands().len(), 1);
}

#[test]
fn unfinished_ci_run_falls_back_to_local_verification() {
    let repo = single_colon_repo();
    let runs = vec![workflow_run(5, "c000001", "in_progress", None)];
    let scripted = Scripted::new(
        vec![app_missing_colon(), passing()],
        ScriptedCi::new(vec![Ok(runs)]),
    );
    let cfg = HealerConfig::default();

    let report = scripted.heal(&cfg, &request(&repo, true));

    assert_eq!(report.outcome.status, HealStatus::Healed);
    assert_eq!(report.outcome.iterations_used, 1);
    assert_eq!(report.outcome.total_commits, 1);
    let first = &report.outcome.iterations[0];
    assert_eq!(first.verdict, Some(Verdict::PassLocal));
    assert_eq!(first.ci_conclusion, "local_pass");
    assert!(scripted.ci.list_calls() > 1);
    assert_eq!(scripted.sandbox.commands().len(), 2);
    assert_eq!(report.result.final_ci_status, CiLabel::Passed);
    assert_eq!(report.result.ci_timeline.len(), 1);
    assert_eq!(report.result.ci_timeline[0].status, CiLabel::Passed);
}

#[test]
fn rejected_push_stops_with_fixes_applied() {
    let repo = single_colon_repo();
    let ci = ScriptedCi::new(Vec::new());
    let vcs = ScriptedVcs::new().failing_push();
    let scripted = Scripted::new(vec![app_missing_colon()], ci).with_vcs(vcs);

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    assert_eq!(report.outcome.status, HealStatus::Partial);
    assert_eq!(report.outcome.iterations_used, 1);
    assert_eq!(report.outcome.total_commits, 1);
    let first = &report.outcome.iterations[0];
    assert_eq!(first.verdict, Some(Verdict::PushFailedFixesApplied));
    assert_eq!(first.commit_sha, "c000001");
    assert_eq!(scripted.vcs.messages().len(), 1);
    assert!(scripted.vcs.pushes().is_empty());
    assert_eq!(scripted.ci.list_calls(), 0);
    assert_eq!(
        repo.read("src/app.py").expect("read"),
        "def add(a, b):\n    return a + b\n"
    );
    assert_eq!(report.result.final_ci_status, CiLabel::Failed);
    assert!(report.result.ci_timeline.is_empty());
    assert_eq!(report.result.fixes[0].status, FixStatus::Applied);
}

#[test]
fn already_green_repository_reports_passed() {
    let repo = single_colon_repo();
    let scripted = Scripted::new(vec![passing()], ScriptedCi::new(Vec::new()));

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    assert_eq!(report.outcome.status, HealStatus::Healed);
    assert_eq!(report.outcome.total_commits, 0);
    assert_eq!(report.result.total_failures_detected, 0);
    assert_eq!(report.result.final_ci_status, CiLabel::Passed);
    assert_eq!(report.result.ci_timeline.len(), 1);
}

#[test]
fn identical_runs_produce_identical_documents() {
    let mut digests = Vec::new();
    let mut documents = Vec::new();
    for _ in 0..3 {
        let repo = single_colon_repo();
        let scripted = Scripted::new(vec![app_missing_colon()], green_ci_for(&["c000001"]));
        let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));
        digests.push(report.result.digest().expect("digest"));
        documents.push(
            report
                .result
                .strip_volatile()
                .to_pretty_json()
                .expect("json"),
        );
    }
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(documents.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn run_artifacts_are_written_under_the_repository() {
    let repo = single_colon_repo();
    let scripted = Scripted::new(vec![app_missing_colon()], green_ci_for(&["c000001"]));

    let report = scripted.heal(&HealerConfig::default(), &request(&repo, true));

    let root = repo.path().canonicalize().expect("canonical");
    assert!(report.paths.result_path.starts_with(&root));
    assert!(report.paths.report_path(1).is_file());
    let written = fs::read_to_string(&report.paths.result_path).expect("read result");
    assert_eq!(written, report.result.to_pretty_json().expect("json"));
}
