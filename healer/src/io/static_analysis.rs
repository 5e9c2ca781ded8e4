//! Static-analysis fallback for repositories with no runnable test suite.
//!
//! Python files are syntax-checked with `py_compile` through the sandbox,
//! JavaScript with `node --check` when node is installed, and Java and
//! JavaScript get a few textual heuristics. Every source file is also dumped
//! as a numbered `SOURCE ANALYSIS` block so the model layer of the
//! classifier can look for defects the checks cannot see.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::io::discovery::is_skipped_dir;
use crate::io::process::{command_succeeds, run_command_with_timeout};
use crate::io::sandbox::{SandboxExecutor, SandboxRequest};

/// Lines of each file included in its source dump.
pub const DUMP_LINES: usize = 60;

const FILE_MARKER: &str = "@@healer-file ";
const EXIT_MARKER: &str = "@@healer-exit ";

static JAVA_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^import\s+([\w.]+)\s*;").expect("java import pattern should compile")
});
static JAVA_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*\w+\s*=\s*.+[^;{}\s]$").expect("java assign pattern should compile")
});
static JS_STRING_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\.(toUpperCase|toLowerCase|charAt|substring|slice|trim|split|replace)\s*\(")
        .expect("js call pattern should compile")
});

/// Output of a static-analysis pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticReport {
    pub output: String,
    pub passes: u32,
    pub errors: u32,
}

impl StaticReport {
    pub fn all_passed(&self) -> bool {
        self.errors == 0
    }
}

#[derive(Debug, Default)]
struct SourceFiles {
    python: Vec<String>,
    javascript: Vec<String>,
    java: Vec<String>,
}

impl SourceFiles {
    fn is_empty(&self) -> bool {
        self.python.is_empty() && self.javascript.is_empty() && self.java.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &String> {
        self.python.iter().chain(&self.javascript).chain(&self.java)
    }
}

fn collect_sources(root: &Path) -> Result<SourceFiles> {
    let mut found = SourceFiles::default();
    collect_into(root, root, &mut found)?;
    found.python.sort();
    found.javascript.sort();
    found.java.sort();
    Ok(found)
}

fn collect_into(root: &Path, dir: &Path, found: &mut SourceFiles) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        // Symlinked directories are not followed.
        if file_type.is_dir() {
            if !is_skipped_dir(&name) {
                collect_into(root, &path, found)?;
            }
            continue;
        }
        if name.starts_with("test_") || name.ends_with("_test.py") {
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => found.python.push(rel),
            Some("js" | "jsx" | "mjs" | "cjs") => found.javascript.push(rel),
            Some("java") => found.java.push(rel),
            _ => {}
        }
    }
    Ok(())
}

/// Run the fallback over `repo`. Returns `None` when the repository holds no
/// Python, JavaScript, or Java sources.
#[instrument(skip_all, fields(repo = %repo.display()))]
pub fn analyze(
    repo: &Path,
    sandbox: &dyn SandboxExecutor,
    timeout: Duration,
) -> Result<Option<StaticReport>> {
    let sources = collect_sources(repo)?;
    if sources.is_empty() {
        return Ok(None);
    }
    info!(
        python = sources.python.len(),
        javascript = sources.javascript.len(),
        java = sources.java.len(),
        "running static analysis"
    );

    let mut lines = Vec::new();
    let mut passes = 0;
    let mut errors = 0;
    let mut record = |rel: &str, issues: Vec<String>, lines: &mut Vec<String>| {
        if issues.is_empty() {
            lines.push(format!("PASS: {rel}"));
            passes += 1;
        } else {
            lines.push(format!("FAIL: {rel}"));
            lines.extend(issues);
            errors += 1;
        }
    };

    let compile = python_syntax(repo, &sources.python, sandbox, timeout);
    for rel in &sources.python {
        let issues = compile
            .iter()
            .find(|(file, _)| file == rel)
            .map(|(_, issue)| vec![issue.clone()])
            .unwrap_or_default();
        record(rel, issues, &mut lines);
    }

    let has_node = !sources.javascript.is_empty()
        && command_succeeds("node", &["--version"], Duration::from_secs(10));
    for rel in &sources.javascript {
        let mut issues = Vec::new();
        if has_node && let Some(issue) = node_check(repo, rel) {
            issues.push(issue);
        }
        if let Ok(text) = fs::read_to_string(repo.join(rel)) {
            issues.extend(js_heuristics(rel, &text));
        }
        record(rel, issues, &mut lines);
    }

    for rel in &sources.java {
        let issues = fs::read_to_string(repo.join(rel))
            .map(|text| java_heuristics(rel, &text))
            .unwrap_or_default();
        record(rel, issues, &mut lines);
    }

    for rel in sources.all() {
        if let Ok(text) = fs::read_to_string(repo.join(rel)) {
            lines.push(source_dump(rel, &text, DUMP_LINES));
        }
    }

    lines.push(format!("\n{passes} passed, {errors} failed"));
    Ok(Some(StaticReport {
        output: lines.join("\n"),
        passes,
        errors,
    }))
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Compile every Python file in one sandbox invocation. Returns the files
/// that failed with their compiler output.
fn python_syntax(
    repo: &Path,
    files: &[String],
    sandbox: &dyn SandboxExecutor,
    timeout: Duration,
) -> Vec<(String, String)> {
    if files.is_empty() {
        return Vec::new();
    }
    let quoted: Vec<String> = files.iter().map(|f| shell_quote(f)).collect();
    let files = quoted.join(" ");
    let command = [
        format!("for f in {files}; do"),
        format!("echo \"{FILE_MARKER}$f\";"),
        "python3 -m py_compile \"$f\" 2>&1;".to_string(),
        format!("echo \"{EXIT_MARKER}$?\";"),
        "done".to_string(),
    ]
    .join(" ");
    let request = SandboxRequest {
        repo_path: repo.to_path_buf(),
        command,
        install_deps: false,
        timeout,
    };
    match sandbox.run(&request) {
        Ok(out) => parse_compile_output(&out.stdout),
        Err(err) => {
            let chain = format!("{err:#}");
            warn!(err = %chain, "python syntax check unavailable");
            Vec::new()
        }
    }
}

fn parse_compile_output(stdout: &str) -> Vec<(String, String)> {
    let mut failed = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in stdout.lines() {
        if let Some(file) = line.strip_prefix(FILE_MARKER) {
            current = Some((file.to_string(), Vec::new()));
        } else if let Some(code) = line.strip_prefix(EXIT_MARKER) {
            if let Some((file, body)) = current.take()
                && code.trim() != "0"
            {
                failed.push((file, body.join("\n")));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    failed
}

fn node_check(repo: &Path, rel: &str) -> Option<String> {
    let mut cmd = Command::new("node");
    cmd.arg("--check").arg(rel).current_dir(repo);
    match run_command_with_timeout(cmd, None, Duration::from_secs(10), 64 * 1024) {
        Ok(out) if out.status.success() => None,
        Ok(out) => Some(out.stderr_text().trim().to_string()),
        Err(err) => Some(format!("{err:#}")),
    }
}

fn traceback_frame(rel: &str, line_no: usize, stripped: &str) -> String {
    format!("  File \"{rel}\", line {line_no}\n    {stripped}")
}

/// Flags string methods called on variables assigned a number literal, and
/// lines directly under a `LOGIC ERROR` comment.
pub fn js_heuristics(rel: &str, text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut issues = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let stripped = line.trim();
        if stripped.starts_with("//") {
            continue;
        }
        if let Some(caps) = JS_STRING_CALL_RE.captures(stripped) {
            let var = &caps[1];
            let method = &caps[2];
            let pattern = format!(r"(?:const|let|var)\s+{}\s*=\s*(\d+)", regex::escape(var));
            let lookback = idx.saturating_sub(19)..idx;
            if let Ok(assign) = Regex::new(&pattern)
                && lines[lookback]
                    .iter()
                    .rev()
                    .any(|prev| assign.is_match(prev.trim()))
            {
                let frame = traceback_frame(rel, line_no, stripped);
                issues.push(format!(
                    "{frame}\nTypeError: {var}.{method} is not a function ({var} is a number)"
                ));
            }
        }
        if idx > 0 {
            let prev = lines[idx - 1].trim();
            let upper = prev.to_uppercase();
            if upper.contains("LOGIC") && upper.contains("ERROR") {
                let hint = prev.trim_start_matches(['/', ' ']).trim();
                let frame = traceback_frame(rel, line_no, stripped);
                issues.push(format!("{frame}\nLogicError: {hint}"));
            }
        }
    }
    issues
}

const STATEMENT_ENDS: &[&str] = &[";", "{", "}", ")", "(", ","];
const DECLARATION_STARTS: &[&str] = &[
    "package ",
    "import ",
    "public ",
    "private ",
    "protected ",
    "class ",
    "if ",
    "if(",
    "else",
    "for ",
    "while ",
    "return;",
    "}",
    "{",
];

/// Missing-semicolon and unused-import heuristics for Java sources.
pub fn java_heuristics(rel: &str, text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut issues = Vec::new();
    let mut imports = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let stripped = line.trim();
        if let Some(caps) = JAVA_IMPORT_RE.captures(stripped) {
            imports.push((line_no, caps[1].to_string()));
        }
        if stripped.is_empty() || ["//", "/*", "*", "@"].iter().any(|p| stripped.starts_with(p)) {
            continue;
        }
        let terminated = STATEMENT_ENDS.iter().any(|end| stripped.ends_with(end));
        let declaration = DECLARATION_STARTS.iter().any(|p| stripped.starts_with(p));
        if !terminated && !declaration && JAVA_ASSIGN_RE.is_match(stripped) {
            let frame = traceback_frame(rel, line_no, stripped);
            issues.push(format!("{frame}\nSyntaxError: missing semicolon"));
        }
    }

    for (line_no, import) in imports {
        let simple = import.rsplit('.').next().unwrap_or(&import);
        let used = lines
            .iter()
            .enumerate()
            .any(|(idx, line)| idx + 1 != line_no && line.contains(simple));
        if !used {
            issues.push(format!("{rel}:{line_no}:0: F401 '{import}' imported but unused"));
        }
    }
    issues
}

/// Numbered dump of the first `max_lines` lines of a file.
pub fn source_dump(rel: &str, text: &str, max_lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let mut numbered: Vec<String> = all
        .iter()
        .take(max_lines)
        .enumerate()
        .map(|(i, line)| format!("{:4} | {line}", i + 1))
        .collect();
    if all.len() > max_lines {
        numbered.push(format!("... ({} more lines)", all.len() - max_lines));
    }
    debug!(file = rel, lines = all.len(), "dumped source");
    format!(
        "\n--- SOURCE ANALYSIS (ALL): {rel} ---\n{}\n--- END {rel} ---",
        numbered.join("\n")
    )
}
