//! Scripted adapters and fixtures for tests.
//!
//! Every scripted adapter replays queued responses in order and repeats the
//! last one once the queue is down to a single entry.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::io::git::{Git, Vcs};
use crate::io::github::{CiProvider, RepoSlug, WorkflowRun};
use crate::io::llm::{ModelClient, ModelError};
use crate::io::retry::Sleeper;
use crate::io::sandbox::{SandboxExecutor, SandboxOutput, SandboxRequest};
use crate::looping::Clock;

fn next<T: Clone>(queue: &RefCell<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.borrow_mut();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

pub fn sandbox_output(exit_code: i32, stdout: &str, stderr: &str) -> SandboxOutput {
    SandboxOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        timed_out: false,
        duration: Duration::from_millis(10),
    }
}

/// Sandbox replaying canned outputs and recording each command it was given.
pub struct ScriptedSandbox {
    outputs: RefCell<VecDeque<SandboxOutput>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(outputs: Vec<SandboxOutput>) -> Self {
        Self {
            outputs: RefCell::new(outputs.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl SandboxExecutor for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        self.commands.borrow_mut().push(request.command.clone());
        next(&self.outputs)
            .ok_or_else(|| anyhow!("no scripted sandbox output for `{}`", request.command))
    }
}

/// Model client replaying canned completions.
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, ModelError>>>,
    calls: Cell<usize>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, _system: &str, _user: &str) -> Result<String, ModelError> {
        self.calls.set(self.calls.get() + 1);
        next(&self.replies)
            .unwrap_or_else(|| Err(ModelError::Transport("no scripted reply".to_string())))
    }
}

pub fn workflow_run(
    id: u64,
    head_sha: &str,
    status: &str,
    conclusion: Option<&str>,
) -> WorkflowRun {
    WorkflowRun {
        id,
        head_sha: head_sha.to_string(),
        status: status.to_string(),
        conclusion: conclusion.map(str::to_string),
        html_url: format!("https://github.com/acme/widgets/actions/runs/{id}"),
    }
}

/// CI provider replaying run listings and log downloads. Errors are given as
/// plain messages.
pub struct ScriptedCi {
    listings: RefCell<VecDeque<Result<Vec<WorkflowRun>, String>>>,
    logs: RefCell<VecDeque<Result<Vec<u8>, String>>>,
    list_calls: Cell<u32>,
}

impl ScriptedCi {
    pub fn new(listings: Vec<Result<Vec<WorkflowRun>, String>>) -> Self {
        Self {
            listings: RefCell::new(listings.into()),
            logs: RefCell::new(VecDeque::new()),
            list_calls: Cell::new(0),
        }
    }

    /// Queue one log download response.
    pub fn with_logs(self, logs: Result<Vec<u8>, String>) -> Self {
        self.logs.borrow_mut().push_back(logs);
        self
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.get()
    }
}

impl CiProvider for ScriptedCi {
    fn list_runs(&self, _slug: &RepoSlug, _branch: &str) -> Result<Vec<WorkflowRun>> {
        self.list_calls.set(self.list_calls.get() + 1);
        match next(&self.listings) {
            Some(Ok(runs)) => Ok(runs),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }

    fn download_logs(&self, _slug: &RepoSlug, run_id: u64) -> Result<Vec<u8>> {
        match next(&self.logs) {
            Some(Ok(body)) => Ok(body),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("no scripted logs for run {run_id}"),
        }
    }
}

/// Sleeper that only counts.
#[derive(Default)]
pub struct NoSleep {
    slept: RefCell<Vec<Duration>>,
}

impl NoSleep {
    pub fn count(&self) -> usize {
        self.slept.borrow().len()
    }
}

impl Sleeper for NoSleep {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Version control double: every commit succeeds with a sequential sha
/// unless the tree is marked clean.
#[derive(Default)]
pub struct ScriptedVcs {
    clean: bool,
    fail_push: bool,
    messages: RefCell<Vec<String>>,
    pushes: RefCell<Vec<String>>,
}

impl ScriptedVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clean(mut self) -> Self {
        self.clean = true;
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.borrow().clone()
    }
}

impl Vcs for ScriptedVcs {
    fn commit_all(&self, _repo: &Path, message: &str) -> Result<Option<String>> {
        if self.clean {
            return Ok(None);
        }
        let mut messages = self.messages.borrow_mut();
        messages.push(message.to_string());
        Ok(Some(format!("c{:06}", messages.len())))
    }

    fn push(&self, _repo: &Path, branch: &str) -> Result<()> {
        if self.fail_push {
            bail!("remote rejected push to {branch}");
        }
        self.pushes.borrow_mut().push(branch.to_string());
        Ok(())
    }
}

pub const FIXED_TIMESTAMP: &str = "2026-01-01T00:00:00+00:00";

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> String {
        FIXED_TIMESTAMP.to_string()
    }
}

/// Temporary git repository seeded with files and one initial commit.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp repo dir")?;
        Git::new(temp.path()).init()?;
        Ok(Self { temp })
    }

    /// Create a repository holding `files` (relative path, contents) committed once.
    pub fn with_files(files: &[(&str, &str)]) -> Result<Self> {
        let repo = Self::new()?;
        for (rel, contents) in files {
            repo.write(rel, contents)?;
        }
        let git = Git::new(repo.path());
        git.add_all()?;
        git.commit_staged("initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.file(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
