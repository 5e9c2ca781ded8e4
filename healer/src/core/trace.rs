//! Re-attribute test-file failures to the source location that raised them.
//!
//! pytest reports failures against the test function. The verbose section for
//! each failed test still names every frame, so the last frame outside the
//! test tree is the real fault location.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::core::classify::dedupe;
use crate::core::path::{is_external_reference, is_in_test_tree, normalize_reported_path};
use crate::core::types::{BugRecord, Category};

static FAILED_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FAILED\s+(\S+?)::(\S+)\s+-\s+(.+)").expect("failed summary pattern should compile")
});

static SECTION_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_{5,}\s+(\S+)\s+_{5,}").expect("section header pattern should compile")
});

static SECTION_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"={5,}").expect("section end pattern should compile"));

static VERBOSE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("verbose ref pattern should compile")
});

static SHORT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\S+\.(?:py|js|ts|jsx|tsx)):(\d+):")
        .expect("short ref pattern should compile")
});

#[derive(Debug, Clone)]
struct FailedTest {
    path: String,
    message: String,
}

/// A verbose failure section for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSection<'a> {
    pub test_name: &'a str,
    pub body: &'a str,
}

/// Replace test-file attributions with the traced source location, when one exists.
pub fn reattribute(bugs: Vec<BugRecord>, log: &str) -> Vec<BugRecord> {
    let failed = failed_tests(log);
    if failed.is_empty() {
        return bugs;
    }

    let mut traced = Vec::new();
    let mut replaced_paths: BTreeSet<String> = BTreeSet::new();
    for section in test_sections(log) {
        let Some(info) = failed.get(section.test_name) else {
            continue;
        };
        let Some((file, line)) = last_source_reference(section.body) else {
            continue;
        };
        debug!(
            test = section.test_name,
            file = %file,
            line,
            "traced test failure to source"
        );
        let category = infer_category(&info.message);
        traced.push(BugRecord::new(file, line, category, info.message.clone()));
        replaced_paths.insert(normalize_reported_path(&info.path, None));
    }

    if traced.is_empty() {
        return bugs;
    }

    let kept = bugs
        .into_iter()
        .filter(|bug| !replaced_paths.contains(&normalize_reported_path(&bug.file, None)));
    dedupe(kept.chain(traced).collect())
}

/// Split the log into `_____ name _____` sections. A section ends at the next
/// header, the next `=====` rule, or the end of the log.
pub fn test_sections(log: &str) -> Vec<TestSection<'_>> {
    let headers: Vec<_> = SECTION_HEADER_RE.captures_iter(log).collect();
    let mut sections = Vec::with_capacity(headers.len());
    for (idx, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body_start = whole.end();
        let next_header = headers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(log.len());
        let next_rule = SECTION_END_RE
            .find_at(log, body_start)
            .map(|m| m.start())
            .unwrap_or(log.len());
        let body_end = next_header.min(next_rule).max(body_start);
        sections.push(TestSection {
            test_name: name.as_str(),
            body: &log[body_start..body_end],
        });
    }
    sections
}

fn failed_tests(log: &str) -> BTreeMap<String, FailedTest> {
    FAILED_SUMMARY_RE
        .captures_iter(log)
        .map(|caps| {
            (
                caps[2].to_string(),
                FailedTest {
                    path: caps[1].to_string(),
                    message: caps[3].trim().to_string(),
                },
            )
        })
        .collect()
}

/// Last file reference in `section` that points at project source.
fn last_source_reference(section: &str) -> Option<(String, u32)> {
    let mut refs: Vec<(usize, String, u32)> = Vec::new();
    for re in [&*VERBOSE_REF_RE, &*SHORT_REF_RE] {
        for caps in re.captures_iter(section) {
            let (Some(whole), Ok(line)) = (caps.get(0), caps[2].parse::<u32>()) else {
                continue;
            };
            refs.push((whole.start(), caps[1].to_string(), line));
        }
    }
    refs.sort_by_key(|(pos, _, _)| *pos);
    refs.into_iter()
        .filter(|(_, file, _)| !is_in_test_tree(file) && !is_external_reference(file))
        .next_back()
        .map(|(_, file, line)| (normalize_reported_path(&file, None), line))
}

/// Category implied by an exception name in a failure message.
pub fn infer_category(message: &str) -> Category {
    let lower = message.to_ascii_lowercase();
    if lower.contains("indexerror")
        || lower.contains("zerodivisionerror")
        || lower.contains("recursionerror")
    {
        Category::Logic
    } else if lower.contains("typeerror") {
        Category::TypeError
    } else if lower.contains("importerror") || lower.contains("modulenotfound") {
        Category::Import
    } else if lower.contains("indentationerror") {
        Category::Indentation
    } else if lower.contains("syntaxerror") {
        Category::Syntax
    } else {
        Category::Logic
    }
}
