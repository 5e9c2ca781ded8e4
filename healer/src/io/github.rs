//! GitHub Actions adapter: workflow run listing and log archive download.

use std::io::{Cursor, Read};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::ci_logs::{join_entries, strip_ansi};
use crate::io::config::CiConfig;

const USER_AGENT: &str = concat!("healer/", env!("CARGO_PKG_VERSION"));
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// `owner/repo` pair parsed from a clone URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl RepoSlug {
    /// Accepts `https://github.com/o/r(.git)` and `git@github.com:o/r(.git)`.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim().trim_end_matches('/');
        let path = if let Some(rest) = url.strip_prefix("git@") {
            rest.split_once(':')?.1
        } else {
            let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
            rest.split_once('/')?.1
        };
        let path = path.strip_suffix(".git").unwrap_or(path);
        let mut parts = path.split('/');
        let owner = parts.next()?.trim();
        let repo = parts.next()?.trim();
        if owner.is_empty() || repo.is_empty() || parts.next().is_some() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

/// One workflow run as listed by the Actions API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

#[derive(Debug, Deserialize)]
struct RunList {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

/// Remote CI seam used by the wait and fetch tools.
pub trait CiProvider {
    /// Most recent push-triggered runs on `branch`, newest first.
    fn list_runs(&self, slug: &RepoSlug, branch: &str) -> Result<Vec<WorkflowRun>>;
    /// Raw log archive bytes for a run.
    fn download_logs(&self, slug: &RepoSlug, run_id: u64) -> Result<Vec<u8>>;
}

/// Prefer the run built from `commit_sha`, else the newest.
pub fn pick_run<'r>(runs: &'r [WorkflowRun], commit_sha: &str) -> Option<&'r WorkflowRun> {
    let sha = commit_sha.trim();
    runs.iter()
        .find(|run| !sha.is_empty() && run.head_sha.starts_with(sha))
        .or_else(|| runs.first())
}

/// Turn a log download into text: zip entries joined in name order, other
/// bodies decoded as-is.
pub fn logs_to_text(body: &[u8]) -> Result<String> {
    if !body.starts_with(ZIP_MAGIC) {
        return Ok(strip_ansi(&String::from_utf8_lossy(body)));
    }
    let mut archive = zip::ZipArchive::new(Cursor::new(body)).context("open log archive")?;
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .with_context(|| format!("read log archive entry {index}"))?;
        if file.is_dir() {
            continue;
        }
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .with_context(|| format!("read log entry {}", file.name()))?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        entries.push((file.name().to_string(), text));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(entries = entries.len(), "unpacked log archive");
    let parts = entries
        .iter()
        .map(|(name, text)| (name.as_str(), text.as_str()));
    Ok(join_entries(parts))
}

/// REST client for the GitHub Actions API.
pub struct GithubClient {
    http: reqwest::blocking::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(cfg: &CiConfig, token: Option<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .context("build github http client")?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl CiProvider for GithubClient {
    #[instrument(skip_all, fields(owner = %slug.owner, repo = %slug.repo, branch = %branch))]
    fn list_runs(&self, slug: &RepoSlug, branch: &str) -> Result<Vec<WorkflowRun>> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs",
            self.api_base, slug.owner, slug.repo
        );
        let resp = self
            .get(&url)
            .query(&[("branch", branch), ("per_page", "5"), ("event", "push")])
            .send()
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url} returned HTTP {status}");
        }
        let list: RunList = resp
            .json()
            .with_context(|| format!("decode run list from {url}"))?;
        Ok(list.workflow_runs)
    }

    #[instrument(skip_all, fields(owner = %slug.owner, repo = %slug.repo, run_id = run_id))]
    fn download_logs(&self, slug: &RepoSlug, run_id: u64) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{run_id}/logs",
            self.api_base, slug.owner, slug.repo
        );
        let resp = self.get(&url).send().with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url} returned HTTP {status}");
        }
        let bytes = resp.bytes().with_context(|| format!("read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}
