//! Isolated command execution for test runs.
//!
//! [`SandboxExecutor`] is the contract the test-running tools consume:
//! given a repository and a shell command, run it somewhere disposable and
//! report exit code, output, and duration. [`DockerSandbox`] mounts the repo
//! into a throwaway container; [`LocalSandbox`] runs the command directly in
//! the repository and is the degraded path when docker is unreachable.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::path::SANDBOX_WORKDIR;
use crate::io::config::{SandboxConfig, SandboxMode};
use crate::io::process::{CommandOutput, command_succeeds, run_command_with_timeout};

/// One command to run against a repository checkout.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub repo_path: PathBuf,
    pub command: String,
    pub install_deps: bool,
    pub timeout: Duration,
}

/// Captured result of a sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl SandboxOutput {
    /// Output describing a run that never got to execute the command.
    pub fn failed_to_start(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: message.into(),
            timed_out: false,
            duration,
        }
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    fn from_command(output: CommandOutput) -> Self {
        Self {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
            duration: output.duration,
        }
    }
}

/// Abstraction over isolated execution backends.
pub trait SandboxExecutor {
    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Run `request.command`. Teardown of anything the backend provisioned
    /// must happen before this returns, on every path.
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput>;
}

/// Dependency manifests at the repo root and how to install them.
const DEP_INSTALL_COMMANDS: &[(&str, &str)] = &[
    ("requirements.txt", "pip install --no-cache-dir -r requirements.txt"),
    ("pyproject.toml", "pip install --no-cache-dir ."),
    ("setup.py", "pip install --no-cache-dir ."),
    ("package.json", "npm install --production=false"),
    ("Pipfile", "pip install pipenv && pipenv install --dev --system"),
];

/// Build a shell snippet installing every detected dependency set, or
/// `None` when nothing needs installing.
pub fn install_script(root_entries: &[String]) -> Option<String> {
    let mut parts = Vec::new();
    let mut python = false;
    for (sentinel, cmd) in DEP_INSTALL_COMMANDS {
        if root_entries.iter().any(|name| name == sentinel) {
            parts.push(format!("echo \">>> Installing from {sentinel}\" && {cmd}"));
            python |= cmd.contains("pip");
        }
    }
    if python || root_entries.iter().any(|name| name.ends_with(".py")) {
        parts.push(
            "echo \">>> Installing pytest\" && pip install --no-cache-dir pytest".to_string(),
        );
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" && "))
    }
}

fn root_entries(repo: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(repo).with_context(|| format!("read dir {}", repo.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", repo.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

static CONTAINER_SEQ: AtomicU32 = AtomicU32::new(0);

fn container_name() -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("healer-sandbox-{}-{seq}", std::process::id())
}

/// Runs commands in an ephemeral `docker run --rm` container with the repo
/// mounted at the sandbox workdir.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub output_limit_bytes: usize,
}

impl DockerSandbox {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            image: cfg.image.clone(),
            memory_limit: cfg.memory_limit.clone(),
            cpu_limit: cfg.cpu_limit,
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    fn script(&self, request: &SandboxRequest) -> Result<String> {
        if !request.install_deps {
            return Ok(request.command.clone());
        }
        let entries = root_entries(&request.repo_path)?;
        Ok(match install_script(&entries) {
            Some(install) => format!("{install} && {}", request.command),
            None => request.command.clone(),
        })
    }

    fn force_remove(&self, name: &str) {
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", name]);
        match run_command_with_timeout(cmd, None, Duration::from_secs(30), 4096) {
            Ok(out) if out.status.success() => debug!(container = name, "container removed"),
            Ok(out) => warn!(
                container = name,
                exit_code = out.exit_code(),
                "container removal failed"
            ),
            Err(err) => warn!(container = name, err = %err, "container removal failed"),
        }
    }
}

impl SandboxExecutor for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip_all, fields(image = %self.image, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        let repo = fs::canonicalize(&request.repo_path)
            .with_context(|| format!("resolve repo {}", request.repo_path.display()))?;
        let script = self.script(request)?;
        let name = container_name();
        let workdir = SANDBOX_WORKDIR.trim_end_matches('/');
        info!(container = %name, command = %request.command, "starting sandbox container");

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("-v")
            .arg(format!("{}:{workdir}", repo.display()))
            .arg("-w")
            .arg(workdir)
            .arg("--memory")
            .arg(&self.memory_limit)
            .arg("--cpus")
            .arg(self.cpu_limit.to_string())
            .arg("-e")
            .arg("PYTHONDONTWRITEBYTECODE=1")
            .arg(&self.image)
            .arg("sh")
            .arg("-c")
            .arg(&script);

        let output = run_command_with_timeout(cmd, None, request.timeout, self.output_limit_bytes)
            .context("run docker")?;
        if output.timed_out {
            warn!(container = %name, "sandbox timed out, removing container");
            self.force_remove(&name);
        }
        Ok(SandboxOutput::from_command(output))
    }
}

/// Runs commands directly in the repository with `sh -c`.
///
/// Dependencies are never installed on the host, whatever the request says.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    pub output_limit_bytes: usize,
}

impl SandboxExecutor for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput> {
        debug!(command = %request.command, repo = %request.repo_path.display(), "running locally");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.repo_path)
            .env("PYTHONDONTWRITEBYTECODE", "1");
        let output = run_command_with_timeout(cmd, None, request.timeout, self.output_limit_bytes)
            .with_context(|| format!("run `{}`", request.command))?;
        Ok(SandboxOutput::from_command(output))
    }
}

/// Pick the executor for `cfg.mode`. `auto` runs `docker info` and falls
/// back to local execution when the daemon is unreachable.
pub fn select_sandbox(cfg: &SandboxConfig) -> Box<dyn SandboxExecutor> {
    let local = || -> Box<dyn SandboxExecutor> {
        Box::new(LocalSandbox {
            output_limit_bytes: cfg.output_limit_bytes,
        })
    };
    match cfg.mode {
        SandboxMode::Docker => Box::new(DockerSandbox::from_config(cfg)),
        SandboxMode::Local => local(),
        SandboxMode::Auto => {
            if command_succeeds("docker", &["info"], Duration::from_secs(15)) {
                info!("docker reachable, using container sandbox");
                Box::new(DockerSandbox::from_config(cfg))
            } else {
                warn!("docker unreachable, running tests locally");
                local()
            }
        }
    }
}

/// Run `request`, turning a backend error into a failed output so callers
/// can keep going.
pub fn run_or_degrade(sandbox: &dyn SandboxExecutor, request: &SandboxRequest) -> SandboxOutput {
    let started = Instant::now();
    match sandbox.run(request) {
        Ok(output) => output,
        Err(err) => {
            let chain = format!("{err:#}");
            warn!(backend = sandbox.name(), err = %chain, "sandbox run failed");
            SandboxOutput::failed_to_start(format!("sandbox error: {chain}"), started.elapsed())
        }
    }
}
