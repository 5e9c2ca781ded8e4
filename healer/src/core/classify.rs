//! Pattern layer of the failure classifier.
//!
//! An ordered bank of regular expressions is run over the full log. Each
//! match yields a [`BugRecord`] (first match per `(file, line, category)`
//! wins). Lines touched by any match are removed from the residual; the
//! residual plus any embedded source-analysis blocks is what the model layer
//! sees.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{BugKey, BugRecord, Category};

/// One entry of the pattern bank.
pub struct PatternRule {
    pub regex: Regex,
    pub category: Category,
    /// Message template; `{detail}` is replaced with the trimmed `detail` capture.
    pub template: &'static str,
}

/// Result of running the pattern bank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternPass {
    pub bugs: Vec<BugRecord>,
    /// Residual lines (noise-filtered) followed by embedded source blocks.
    pub residual: Vec<String>,
}

const TRACE_BRIDGE: &str = r#"File "(?P<file>[^"]+)", line (?P<line>\d+)(?:.*\n){1,5}.*?"#;
const HEURISTIC_FRAME: &str = r#"File "(?P<file>[^"]+)", line (?P<line>\d+)\n\s+.+\n"#;
const GENERIC_LOCATION: &str = r"(?P<file>[^\s:]+\.[a-zA-Z0-9]+):(?P<line>\d+).*\b";
const PY_COMPILE_TAIL: &str = r"\s*\('?(?P<file>[^']+?)'?,\s*line\s+(?P<line>\d+)\)";

static RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(build_rules);

static SOURCE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)--- SOURCE ANALYSIS .+?---\n.+?\n--- END .+?---")
        .expect("source block pattern should compile")
});

fn rule(pattern: &str, category: Category, template: &'static str) -> PatternRule {
    let regex = Regex::new(&format!("(?mi){pattern}")).expect("classifier pattern should compile");
    PatternRule {
        regex,
        category,
        template,
    }
}

/// Python traceback frame followed, within five lines, by `detail`.
fn traced(detail: &str, category: Category) -> PatternRule {
    let pattern = format!("{TRACE_BRIDGE}(?P<detail>{detail})");
    rule(&pattern, category, "{detail}")
}

/// `Sorry: <kind>: ... ('file.py', line 8)` as printed by py_compile.
fn py_compile(kind: &str, category: Category) -> PatternRule {
    let pattern = format!(r"Sorry:\s*(?P<detail>{kind}:.+?){PY_COMPILE_TAIL}");
    rule(&pattern, category, "{detail}")
}

fn heuristic(detail: &str, category: Category) -> PatternRule {
    let pattern = format!("{HEURISTIC_FRAME}(?P<detail>{detail})");
    rule(&pattern, category, "{detail}")
}

fn located(detail: &str, category: Category) -> PatternRule {
    let pattern = format!("{GENERIC_LOCATION}(?P<detail>{detail})");
    rule(&pattern, category, "{detail}")
}

fn build_rules() -> Vec<PatternRule> {
    use Category::{Import, Indentation, Linting, Logic, Syntax, TypeError};

    vec![
        // Python tracebacks: bridge up to five lines between the frame and the error.
        traced("IndentationError:.+", Indentation),
        traced("TabError:.+", Indentation),
        traced("SyntaxError:.+", Syntax),
        traced("TypeError:.+", TypeError),
        traced("(?:ImportError|ModuleNotFoundError):.+", Import),
        traced("AssertionError.*", Logic),
        // pytest short form
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+): (?P<detail>AssertionError.*)",
            Logic,
            "AssertionError: {detail}",
        ),
        // flake8 / ruff, pylint
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+):\d+:\s*(?P<detail>[EWFCB]\d+\s+.+)",
            Linting,
            "{detail}",
        ),
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+):\d+:\s*(?P<detail>[CRWEF]\d{4}:.+)",
            Linting,
            "{detail}",
        ),
        rule(
            r#"(?P<file>[^\s:]+):(?P<line>\d+).*(?P<detail>['"]?\w+['"]?\s+imported but unused.*)"#,
            Linting,
            "unused import: {detail}",
        ),
        // JS / TS
        rule(
            concat!(
                r"(?P<file>[^\s:]+\.(?:js|ts|jsx|tsx|mjs|cjs)):(?P<line>\d+)",
                r"\n.*\n\s*(?P<detail>SyntaxError:.+)"
            ),
            Syntax,
            "{detail}",
        ),
        rule(
            r"(?P<file>[^\s(]+\.tsx?)\((?P<line>\d+),\d+\):\s*error\s+(?P<detail>TS\d+:.+)",
            TypeError,
            "{detail}",
        ),
        rule(
            r"(?P<file>[^\s:]+\.tsx?):(?P<line>\d+):\d+\s*-\s*error\s+(?P<detail>TS\d+:.+)",
            TypeError,
            "{detail}",
        ),
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+):\d+\s+(?:error|warning)\s+(?P<detail>.+?)\s{2,}\S+",
            Linting,
            "{detail}",
        ),
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+).*Cannot find module\s+'(?P<detail>[^']+)'",
            Import,
            "Cannot find module '{detail}'",
        ),
        rule(
            r"(?P<file>[^\s:]+):(?P<line>\d+).*(?P<detail>expect\(.+\)\.\w+\(.+\))",
            Logic,
            "Assertion failure: {detail}",
        ),
        py_compile("SyntaxError", Syntax),
        py_compile("IndentationError", Indentation),
        py_compile("TabError", Indentation),
        rule(
            concat!(
                r"FAIL:\s*(?P<detail>(?:SyntaxError|IndentationError|TabError):.+?)",
                r"\s*\(?(?P<file>[^\s',]+?)(?:,|\s+)line\s+(?P<line>\d+)"
            ),
            Syntax,
            "{detail}",
        ),
        // node --check
        rule(
            concat!(
                r"(?P<file>[^\s:]+\.(?:js|jsx|mjs|cjs)):(?P<line>\d+)\s*\n",
                r".*\n\n\s*(?P<detail>SyntaxError:.+)"
            ),
            Syntax,
            "{detail}",
        ),
        // Static-analysis heuristic frames
        heuristic("TypeError:.+", TypeError),
        heuristic("LogicError:.+", Logic),
        rule(
            concat!(
                r#"File "(?P<file>[^"]+\.java)", line (?P<line>\d+)\n"#,
                r"\s+.+\n(?P<detail>SyntaxError:.+)"
            ),
            Syntax,
            "{detail}",
        ),
        // Broad fallbacks, checked last
        rule(
            r#"File "(?P<file>[^"]+)", line (?P<line>\d+).*(?P<detail>expected.+:)"#,
            Syntax,
            "{detail}",
        ),
        located(
            "(?:IndentationError|unexpected indent|unindent does not match).+",
            Indentation,
        ),
        located(
            "(?:SyntaxError|invalid syntax|unexpected EOF|missing colon).+",
            Syntax,
        ),
        located("(?:TypeError|type mismatch|cannot assign).+", TypeError),
        located(
            "(?:ModuleNotFoundError|ImportError|No module named|Cannot find module).+",
            Import,
        ),
        located("(?:AssertionError|assertion failed|assert ).+", Logic),
    ]
}

/// Number of rules in the pattern bank.
pub fn rule_count() -> usize {
    RULES.len()
}

/// Run the pattern bank over `log`.
pub fn classify_patterns(log: &str) -> PatternPass {
    let mut bugs = Vec::new();
    let mut seen: HashSet<BugKey> = HashSet::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for rule in RULES.iter() {
        for caps in rule.regex.captures_iter(log) {
            let (Some(file), Some(line)) = (caps.name("file"), caps.name("line")) else {
                continue;
            };
            let Ok(line) = line.as_str().parse::<u32>() else {
                continue;
            };
            if let Some(whole) = caps.get(0) {
                spans.push((whole.start(), whole.end()));
            }
            let detail = caps.name("detail").map(|m| m.as_str().trim()).unwrap_or("");
            let message = if detail.is_empty() {
                rule.template.to_string()
            } else {
                rule.template.replace("{detail}", detail)
            };
            let bug = BugRecord::new(file.as_str(), line, rule.category, message);
            if seen.insert(bug.key()) {
                bugs.push(bug);
            }
        }
    }

    let residual = residual_lines(log, &spans);
    PatternPass { bugs, residual }
}

/// Merge model findings into pattern findings; existing keys win.
pub fn merge_findings(primary: Vec<BugRecord>, secondary: Vec<BugRecord>) -> Vec<BugRecord> {
    let mut seen: HashSet<BugKey> = primary.iter().map(BugRecord::key).collect();
    let mut merged = primary;
    for bug in secondary {
        if seen.insert(bug.key()) {
            merged.push(bug);
        }
    }
    merged
}

/// Drop repeated keys, keeping the first occurrence.
pub fn dedupe(bugs: Vec<BugRecord>) -> Vec<BugRecord> {
    merge_findings(Vec::new(), bugs)
}

/// Compute the residual by subtracting matched line intervals from the log.
fn residual_lines(log: &str, spans: &[(usize, usize)]) -> Vec<String> {
    let lines: Vec<&str> = log.split('\n').collect();
    let mut useful: Vec<String> = Vec::new();

    if spans.is_empty() {
        useful.extend(lines.iter().map(|l| l.trim().to_string()));
    } else {
        let starts = line_starts(log);
        let mut covered = vec![false; lines.len()];
        for &(start, end) in spans {
            let first = line_index(&starts, start);
            let last = line_index(&starts, end.saturating_sub(1).max(start));
            for flag in covered.iter_mut().take(last + 1).skip(first) {
                *flag = true;
            }
        }
        for (line, covered) in lines.iter().zip(covered) {
            let stripped = line.trim();
            if covered || stripped.starts_with("Traceback") || stripped.len() <= 10 {
                continue;
            }
            useful.push(stripped.to_string());
        }
    }

    useful.retain(|line| !is_noise(line));
    useful.extend(SOURCE_BLOCK_RE.find_iter(log).map(|m| m.as_str().to_string()));
    useful
}

fn is_noise(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("---")
        || line.starts_with("===")
        || line.starts_with("FAILED")
        || line.starts_with("PASSED")
        || line.to_ascii_lowercase().contains("short test summary")
}

fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect()
}

fn line_index(starts: &[usize], offset: usize) -> usize {
    starts
        .partition_point(|&start| start <= offset)
        .saturating_sub(1)
}
