//! Test framework discovery.
//!
//! Scans a repository for config files, dependency manifests, and test file
//! naming conventions and returns the commands that run its test suites.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Directories never descended into.
pub const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".venv",
    "venv",
    "env",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "dist",
    "build",
    ".next",
    "coverage",
];

/// Minimum confidence (in hundredths) for a detector to report a match.
const THRESHOLD: u32 = 30;

const TRACKED_CONFIGS: &[&str] = &[
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "setup.cfg",
    "pytest.ini",
    "tox.ini",
    "conftest.py",
    "jest.config.js",
    "jest.config.ts",
    "jest.config.mjs",
    "jest.config.cjs",
    "vitest.config.js",
    "vitest.config.ts",
    "vitest.config.mts",
    "vite.config.ts",
    "vite.config.js",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameworkMatch {
    pub framework: &'static str,
    pub command: String,
    /// Confidence in hundredths, capped at 100.
    pub confidence: u32,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Discovery {
    pub commands: Vec<String>,
    pub frameworks: Vec<FrameworkMatch>,
}

/// Files collected by one sorted walk of the repository.
#[derive(Debug, Default)]
pub struct RepoScan {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
    configs: BTreeMap<String, PathBuf>,
    package_json: Option<Value>,
    pyproject: Option<String>,
    requirements: Option<String>,
}

impl RepoScan {
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn new(root: &Path) -> Result<Self> {
        let mut scan = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };
        walk(root, &mut scan.files)?;
        for file in &scan.files {
            if let Some(name) = file.file_name().and_then(|n| n.to_str())
                && TRACKED_CONFIGS.contains(&name)
            {
                scan.configs
                    .entry(name.to_string())
                    .or_insert_with(|| file.clone());
            }
        }
        scan.package_json = scan
            .read_config("package.json")
            .and_then(|text| serde_json::from_str(&text).ok());
        scan.pyproject = scan.read_config("pyproject.toml");
        scan.requirements = scan.read_config("requirements.txt");
        let configs: Vec<_> = scan.configs.keys().collect();
        debug!(files = scan.files.len(), configs = ?configs, "scanned repository");
        if scan.files.is_empty() {
            warn!("no files found in repository");
        }
        Ok(scan)
    }

    fn read_config(&self, name: &str) -> Option<String> {
        let path = self
            .configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.root.join(name));
        fs::read_to_string(path).ok()
    }

    fn has_config(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    fn pyproject_mentions(&self, needle: &str) -> bool {
        self.pyproject
            .as_deref()
            .is_some_and(|text| text.contains(needle))
    }

    fn config_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.configs
            .keys()
            .map(String::as_str)
            .find(|name| name.starts_with(prefix))
    }

    fn with_extension(&self, exts: &'static [&'static str]) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().filter(move |p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| exts.contains(&e))
        })
    }

    fn python_test_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.with_extension(&["py"]).filter(|p| {
            let name = file_name(p);
            name.starts_with("test_") || name.ends_with("_test.py")
        })
    }

    fn js_spec_files(&self) -> usize {
        self.with_extension(&["js", "jsx", "ts", "tsx", "mjs", "cjs"])
            .filter(|p| {
                let name = file_name(p);
                name.contains(".test.") || name.contains(".spec.")
            })
            .count()
    }

    fn package_deps(&self) -> BTreeMap<String, Value> {
        let mut deps = BTreeMap::new();
        if let Some(pkg) = &self.package_json {
            for section in ["dependencies", "devDependencies"] {
                if let Some(map) = pkg.get(section).and_then(Value::as_object) {
                    deps.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        deps
    }

    fn test_script(&self) -> String {
        self.package_json
            .as_ref()
            .and_then(|pkg| pkg.pointer("/scripts/test"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase()
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// True when a directory entry named `name` should not be walked.
pub fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

/// Every file under `root` in sorted walk order, skipping ignored directories.
pub fn repo_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk(root, &mut files)?;
    Ok(files)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("file type of {}", path.display()))?;
        if file_type.is_symlink() && path.is_dir() {
            debug!(path = %path.display(), "not following symlinked directory");
            continue;
        }
        entries.push((path, file_type.is_dir()));
    }
    entries.sort();
    let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(_, is_dir)| *is_dir);
    out.extend(files.into_iter().map(|(path, _)| path));
    for (sub, _) in dirs {
        if is_skipped_dir(file_name(&sub)) {
            continue;
        }
        walk(&sub, out)?;
    }
    Ok(())
}

/// Scan `root` and return the test commands to run, best first.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn discover(root: &Path) -> Result<Discovery> {
    if !root.is_dir() {
        warn!("repository path does not exist");
        return Ok(Discovery::default());
    }
    let scan = RepoScan::new(root)?;
    let mut matches: Vec<FrameworkMatch> = [
        detect_pytest(&scan),
        detect_unittest(&scan),
        detect_jest(&scan),
        detect_vitest(&scan),
    ]
    .into_iter()
    .flatten()
    .collect();
    matches.sort_by(|a, b| b.confidence.cmp(&a.confidence));

    let mut discovery = Discovery::default();
    for m in matches {
        if discovery.commands.contains(&m.command) {
            continue;
        }
        discovery.commands.push(m.command.clone());
        discovery.frameworks.push(m);
    }
    info!(commands = ?discovery.commands, "discovered test commands");
    Ok(discovery)
}

fn finish(
    framework: &'static str,
    command: &str,
    points: u32,
    evidence: Vec<String>,
) -> Option<FrameworkMatch> {
    (points >= THRESHOLD).then(|| FrameworkMatch {
        framework,
        command: command.to_string(),
        confidence: points.min(100),
        evidence,
    })
}

fn detect_pytest(scan: &RepoScan) -> Option<FrameworkMatch> {
    let mut evidence = Vec::new();
    let mut points = 0;
    if scan.has_config("conftest.py") {
        evidence.push("conftest.py found".to_string());
        points += 40;
    }
    if scan.has_config("pytest.ini") {
        evidence.push("pytest.ini found".to_string());
        points += 30;
    }
    if scan.pyproject_mentions("[tool.pytest") {
        evidence.push("[tool.pytest] section in pyproject.toml".to_string());
        points += 30;
    }
    let setup_cfg = scan.read_config("setup.cfg").unwrap_or_default();
    if setup_cfg.contains("[tool:pytest]") {
        evidence.push("[tool:pytest] in setup.cfg".to_string());
        points += 30;
    }
    let listed = Regex::new(r"(?m)^pytest\b").ok();
    if let (Some(re), Some(reqs)) = (listed, scan.requirements.as_deref())
        && re.is_match(reqs)
    {
        evidence.push("pytest listed in requirements.txt".to_string());
        points += 30;
    }
    if scan.pyproject_mentions("pytest") {
        evidence.push("pytest referenced in pyproject.toml".to_string());
        points += 20;
    }
    let test_files = scan.python_test_files().count();
    if test_files > 0 {
        evidence.push(format!("{test_files} test file(s) matching test_*.py / *_test.py"));
        points += 20;
    }
    if scan.root.join("tests").is_dir() || scan.root.join("test").is_dir() {
        evidence.push("tests/ directory found".to_string());
        points += 10;
    }
    finish("pytest", "pytest", points, evidence)
}

fn detect_unittest(scan: &RepoScan) -> Option<FrameworkMatch> {
    let import = Regex::new(r"(?m)^\s*(import unittest|from unittest)").ok()?;
    let importing = scan
        .python_test_files()
        .filter(|p| fs::read_to_string(p).is_ok_and(|text| import.is_match(&text)))
        .count() as u32;
    if importing == 0 {
        return None;
    }
    let mut evidence = vec![format!("{importing} file(s) import unittest")];
    let mut points = 30 + (importing * 10).min(30);
    let pytest_configured = scan.has_config("conftest.py")
        || scan.has_config("pytest.ini")
        || scan.pyproject_mentions("[tool.pytest");
    if !pytest_configured {
        evidence.push("no pytest config found, unittest is primary".to_string());
        points += 20;
    }
    let command = "python -m unittest discover -s tests -v";
    finish("unittest", command, points, evidence)
}

fn detect_jest(scan: &RepoScan) -> Option<FrameworkMatch> {
    let mut evidence = Vec::new();
    let mut points = 0;
    if let Some(cfg) = scan.config_with_prefix("jest.config") {
        evidence.push(format!("config file: {cfg}"));
        points += 50;
    }
    let deps = scan.package_deps();
    if deps.contains_key("jest") {
        evidence.push("jest in package.json dependencies".to_string());
        points += 40;
    }
    if deps.contains_key("ts-jest") || deps.contains_key("@jest/core") {
        evidence.push("ts-jest or @jest/core in deps".to_string());
        points += 20;
    }
    let script = scan.test_script();
    if script.contains("jest") {
        evidence.push(format!("package.json scripts.test = \"{script}\""));
        points += 30;
    }
    if matches!(&scan.package_json, Some(pkg) if pkg.get("jest").is_some()) {
        evidence.push("jest config block in package.json".to_string());
        points += 30;
    }
    let specs = scan.js_spec_files();
    if specs > 0 {
        evidence.push(format!("{specs} test/spec file(s)"));
        points += 15;
    }
    if scan.root.join("__tests__").is_dir() {
        evidence.push("__tests__/ directory found".to_string());
        points += 10;
    }
    let command = if script.contains("jest") {
        "npm test"
    } else {
        "npx jest"
    };
    finish("jest", command, points, evidence)
}

fn detect_vitest(scan: &RepoScan) -> Option<FrameworkMatch> {
    let mut evidence = Vec::new();
    let mut points = 0;
    let config = scan.config_with_prefix("vitest.config");
    if let Some(cfg) = config {
        evidence.push(format!("config file: {cfg}"));
        points += 50;
    }
    let test_block = Regex::new(r"test\s*:").ok();
    for vite in ["vite.config.ts", "vite.config.js"] {
        if !scan.has_config(vite) {
            continue;
        }
        let Some(text) = scan.read_config(vite) else {
            continue;
        };
        if text.to_lowercase().contains("vitest") {
            evidence.push(format!("vitest reference in {vite}"));
            points += 40;
        }
        if test_block.as_ref().is_some_and(|re| re.is_match(&text)) {
            evidence.push(format!("test config block in {vite}"));
            points += 20;
        }
    }
    if scan.package_deps().contains_key("vitest") {
        evidence.push("vitest in package.json dependencies".to_string());
        points += 50;
    }
    let script = scan.test_script();
    if script.contains("vitest") {
        evidence.push(format!("package.json scripts.test = \"{script}\""));
        points += 30;
    }
    if config.is_some() || evidence.iter().any(|e| e.contains("vitest")) {
        let specs = scan.js_spec_files();
        if specs > 0 {
            evidence.push(format!("{specs} test/spec file(s)"));
            points += 10;
        }
    }
    let command = if script.contains("vitest") {
        "npm test"
    } else {
        "npx vitest run"
    };
    finish("vitest", command, points, evidence)
}
