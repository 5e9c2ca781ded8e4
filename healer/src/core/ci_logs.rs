//! CI log text helpers: ANSI stripping, archive entry layout, and test count parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern should compile"));

static PASS_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(\d+)\s+passed",
        r"Tests:\s+(\d+)\s+passed",
        r"(\d+)\s+tests?\s+passed",
        r"OK\s*\((\d+)\s+test",
    ])
});

static FAIL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(\d+)\s+failed",
        r"Tests:\s+.*?(\d+)\s+failed",
        r"FAILED\s*\(.*?failures=(\d+)",
        r"(\d+)\s+tests?\s+failed",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("ci count pattern should compile"))
        .collect()
}

/// Summed pass/fail counts found in CI output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Join archive entries (already sorted by name) as `=== name ===` sections.
pub fn join_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    entries
        .into_iter()
        .map(|(name, content)| format!("=== {name} ===\n{}\n", strip_ansi(content)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sum every pass/fail count across the known runner summary formats.
///
/// Each pattern contributes independently, so a line matched by two patterns
/// is counted twice; the counts are a signal, not an exact tally.
pub fn parse_counts(logs: &str) -> TestCounts {
    let sum = |patterns: &[Regex]| -> u32 {
        patterns
            .iter()
            .flat_map(|re| re.captures_iter(logs))
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .fold(0u32, u32::saturating_add)
    };
    TestCounts {
        passed: sum(&PASS_RES),
        failed: sum(&FAIL_RES),
    }
}

/// Synthetic log text used when the real logs cannot be downloaded.
pub fn synthetic_logs(conclusion: &str) -> String {
    format!("[CI conclusion: {conclusion}]")
}
