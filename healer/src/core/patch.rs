//! Line-level patch helpers: source splitting, change accounting, diff
//! summaries, and search/replace blocks returned by the model.

use std::sync::LazyLock;

use regex::Regex;

/// Default bound on lines a single patch may change.
pub const DEFAULT_MAX_CHANGED_LINES: usize = 20;

static LINE_NUMBER_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+\s+\|\s?").expect("line number prefix pattern should compile")
});

/// File contents split into lines, remembering whether the file ended with a newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub lines: Vec<String>,
    pub trailing_newline: bool,
}

impl SourceText {
    pub fn parse(text: &str) -> Self {
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let lines = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n').map(str::to_string).collect()
        };
        Self {
            lines,
            trailing_newline,
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn with_lines(&self, lines: Vec<String>) -> Self {
        Self {
            lines,
            trailing_newline: self.trailing_newline,
        }
    }
}

/// Number of lines a patch really changes: after trimming the common prefix
/// and suffix, the larger of the two remaining middle sections.
pub fn changed_line_count(old: &[String], new: &[String]) -> usize {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    (old.len() - prefix - suffix).max(new.len() - prefix - suffix)
}

/// Positional `L{n}: -old → +new` entries for lines that differ, truncated to `limit`.
pub fn diff_summary(old: &[String], new: &[String], limit: usize) -> Vec<String> {
    old.iter()
        .zip(new)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(idx, (a, b))| format!("L{}: -{} → +{}", idx + 1, a.trim_end(), b.trim_end()))
        .take(limit)
        .collect()
}

/// Render `lines` with `{n:4} | ` prefixes, numbering from `first_line_no`.
pub fn numbered(lines: &[String], first_line_no: usize) -> String {
    let mut out = String::new();
    for (offset, line) in lines.iter().enumerate() {
        out.push_str(&format!("{:4} | {}\n", first_line_no + offset, line));
    }
    out
}

/// Zero-based `[start, end)` window of `before` lines above and `after` lines
/// below a 1-based line number, clamped to the file.
pub fn window(line_no: usize, len: usize, before: usize, after: usize) -> (usize, usize) {
    let start = line_no.saturating_sub(before + 1);
    let end = (line_no + after).min(len);
    (start.min(end), end)
}

/// Search/replace block parsed from a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplace {
    pub search: Vec<String>,
    pub replace: Vec<String>,
}

/// Parse a `<<<<` search `====` replace `>>>>` block, tolerating code fences
/// and stray `NN | ` prefixes on replacement lines.
pub fn parse_search_replace(content: &str) -> Option<SearchReplace> {
    let cleaned = content.replace("```python", "").replace("```", "");
    let cleaned = cleaned.trim();
    if !(cleaned.contains("<<<<") && cleaned.contains("====") && cleaned.contains(">>>>")) {
        return None;
    }
    let (head, tail) = cleaned.split_once("====")?;
    let search = head.rsplit("<<<<").next().unwrap_or("").trim_matches('\n');
    let replace = tail.split(">>>>").next().unwrap_or("").trim_matches('\n');
    let search = search.lines().map(str::to_string).collect();
    let replace = replace
        .lines()
        .map(|l| LINE_NUMBER_PREFIX_RE.replace(l, "").into_owned())
        .collect();
    Some(SearchReplace { search, replace })
}

/// Apply a search/replace block: replace the first verbatim occurrence of the
/// search lines, otherwise replace the `[start, end)` window wholesale.
pub fn apply_search_replace(
    lines: &[String],
    block: &SearchReplace,
    window: (usize, usize),
) -> Vec<String> {
    if !block.search.is_empty()
        && let Some(pos) = find_subsequence(lines, &block.search)
    {
        let mut out = lines.to_vec();
        out.splice(pos..pos + block.search.len(), block.replace.iter().cloned());
        return out;
    }
    let (start, end) = window;
    let end = end.min(lines.len());
    let start = start.min(end);
    let mut out = lines[..start].to_vec();
    out.extend(block.replace.iter().cloned());
    out.extend_from_slice(&lines[end..]);
    out
}

fn find_subsequence(haystack: &[String], needle: &[String]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
