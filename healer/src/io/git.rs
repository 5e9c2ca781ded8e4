//! Git adapter used by the commit step and branch setup.
//!
//! A small, explicit wrapper around `git` subprocess calls. The [`Vcs`] trait
//! is the seam the commit tool depends on so tests can script commits and
//! push failures without a remote.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

/// Identity used when the repository has none configured.
const FALLBACK_USER_NAME: &str = "healer-bot";
const FALLBACK_USER_EMAIL: &str = "healer-bot@users.noreply.github.com";

/// Commit and push operations consumed by the commit step.
pub trait Vcs {
    /// Stage every change and commit it. Returns the short sha, or `None`
    /// when the working tree was clean.
    fn commit_all(&self, repo: &Path, message: &str) -> Result<Option<String>>;

    /// Push `branch` to `origin`, setting upstream.
    fn push(&self, repo: &Path, branch: &str) -> Result<()>;
}

/// [`Vcs`] backed by the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

impl Vcs for GitCli {
    fn commit_all(&self, repo: &Path, message: &str) -> Result<Option<String>> {
        let git = Git::new(repo);
        git.add_all()?;
        if !git.commit_staged(message)? {
            return Ok(None);
        }
        git.head_short_sha(7).map(Some)
    }

    fn push(&self, repo: &Path, branch: &str) -> Result<()> {
        Git::new(repo).push(branch)
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// `git init` on a `main` branch.
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "-q", "-b", "main"])?;
        Ok(())
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check out `branch`, creating it at HEAD when it does not exist yet.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn ensure_branch(&self, branch: &str) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            debug!(branch, "already on branch");
            return Ok(());
        }
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            info!(branch, "creating branch");
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    /// Stage all changes except run artifacts (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A", "--", ".", ":(exclude).healer"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.ensure_identity()?;
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    pub fn push(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing to origin");
        self.run_checked(&["push", "-u", "origin", branch])?;
        Ok(())
    }

    /// Configure a local committer identity when none is set.
    fn ensure_identity(&self) -> Result<()> {
        let email = self.run(&["config", "user.email"])?;
        if email.status.success() && !String::from_utf8_lossy(&email.stdout).trim().is_empty() {
            return Ok(());
        }
        warn!("no git identity configured, using fallback");
        self.run_checked(&["config", "user.name", FALLBACK_USER_NAME])?;
        self.run_checked(&["config", "user.email", FALLBACK_USER_EMAIL])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
