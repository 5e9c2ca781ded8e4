//! Healer configuration stored under `.healer/config.toml`.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::{Budgets, DEFAULT_MAX_COMMITS, DEFAULT_MAX_ITERATIONS};
use crate::core::patch::DEFAULT_MAX_CHANGED_LINES;
use crate::core::result::ScoreRules;

/// Directory (relative to the working directory) holding config and run artifacts.
pub const HEALER_DIR: &str = ".healer";
pub const CONFIG_FILE: &str = "config.toml";

/// Healer configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// pipeline has always used, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealerConfig {
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    pub sandbox: SandboxConfig,
    pub model: ModelConfig,
    pub ci: CiConfig,
    pub patch: PatchConfig,
    pub result: ResultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Hard cap on commits across all iterations of one run.
    pub max_commits: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_commits: DEFAULT_MAX_COMMITS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Use docker when `docker info` succeeds, otherwise run locally.
    Auto,
    Docker,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub image: String,
    pub timeout_secs: u64,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub install_deps: bool,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Auto,
            image: "python:3.11-slim".to_string(),
            timeout_secs: 300,
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            install_deps: true,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// OpenAI-compatible API root; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            temperature: 0.0,
            top_p: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    /// Consecutive polls with no matching run before giving up early.
    pub no_workflow_bail_polls: u32,
    pub token_env: String,
    pub api_base: String,
    /// Verify locally when the remote has no workflow at all.
    pub local_fallback_when_no_workflow: bool,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_wait_secs: 600,
            no_workflow_bail_polls: 4,
            token_env: "GITHUB_TOKEN".to_string(),
            api_base: "https://api.github.com".to_string(),
            local_fallback_when_no_workflow: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchConfig {
    pub max_changed_lines: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_changed_lines: DEFAULT_MAX_CHANGED_LINES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResultConfig {
    pub speed_bonus_threshold_secs: f64,
    pub free_commits: usize,
}

impl Default for ResultConfig {
    fn default() -> Self {
        let rules = ScoreRules::default();
        Self {
            speed_bonus_threshold_secs: rules.speed_bonus_threshold_secs,
            free_commits: rules.free_commits,
        }
    }
}

impl HealerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.loop_.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        if self.loop_.max_commits == 0 {
            return Err(anyhow!("loop.max_commits must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image must be non-empty"));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(anyhow!("model.base_url must be non-empty"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.ci.poll_interval_secs == 0 || self.ci.max_wait_secs == 0 {
            return Err(anyhow!("ci.poll_interval_secs and ci.max_wait_secs must be > 0"));
        }
        if self.patch.max_changed_lines == 0 {
            return Err(anyhow!("patch.max_changed_lines must be > 0"));
        }
        Ok(())
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_iterations: self.loop_.max_iterations,
            max_commits: self.loop_.max_commits,
        }
    }

    pub fn score_rules(&self) -> ScoreRules {
        ScoreRules {
            speed_bonus_threshold_secs: self.result.speed_bonus_threshold_secs,
            free_commits: self.result.free_commits,
        }
    }
}

/// Credentials read once at startup and passed to the adapters that need them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub model_api_key: Option<String>,
    pub ci_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |secret: &Option<String>| secret.as_ref().map(|_| "<set>");
        f.debug_struct("Secrets")
            .field("model_api_key", &mask(&self.model_api_key))
            .field("ci_token", &mask(&self.ci_token))
            .finish()
    }
}

impl Secrets {
    pub fn from_env(cfg: &HealerConfig) -> Self {
        let read = |name: &str| env::var(name).ok().filter(|value| !value.trim().is_empty());
        let secrets = Self {
            model_api_key: read(&cfg.model.api_key_env),
            ci_token: read(&cfg.ci.token_env),
        };
        debug!(?secrets, "loaded secrets");
        secrets
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HealerConfig::default()`.
pub fn load_config(path: &Path) -> Result<HealerConfig> {
    if !path.exists() {
        let cfg = HealerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HealerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HealerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HealerConfig::default());
        assert_eq!(cfg.loop_.max_iterations, 5);
        assert_eq!(cfg.loop_.max_commits, 10);
        assert_eq!(cfg.patch.max_changed_lines, 20);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".healer").join("config.toml");
        let mut cfg = HealerConfig::default();
        cfg.sandbox.mode = SandboxMode::Local;
        cfg.ci.local_fallback_when_no_workflow = false;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let body = "[loop]\nmax_iterations = 2\n\n[sandbox]\nmode = \"docker\"\n";
        fs::write(&path, body).expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.loop_.max_iterations, 2);
        assert_eq!(cfg.loop_.max_commits, 10);
        assert_eq!(cfg.sandbox.mode, SandboxMode::Docker);
        assert_eq!(cfg.sandbox.image, "python:3.11-slim");
    }

    #[test]
    fn zero_budget_is_rejected() {
        let mut cfg = HealerConfig::default();
        cfg.loop_.max_commits = 0;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("max_commits"));
    }

    #[test]
    fn secrets_debug_hides_values() {
        let secrets = Secrets {
            model_api_key: Some("sk-secret".into()),
            ci_token: None,
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<set>"));
    }
}
