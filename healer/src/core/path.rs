//! Path conventions shared by classification, planning, and export.
//!
//! All helpers operate on `/`-separated strings as they appear in logs; none
//! of them touch the filesystem.

use std::sync::LazyLock;

use regex::Regex;

static TEST_FILE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(^|/)test_[^/]+\.py$",
        r"(^|/)[^/]+_test\.py$",
        r"(^|/)[^/]+\.(test|spec)\.(js|ts|jsx|tsx|mjs|cjs)$",
        r"(^|/)__tests__/",
        r"(^|/)tests?/test_",
        r"(^|/)conftest\.py$",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("test file pattern should compile"))
    .collect()
});

static TEST_TREE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|/)tests?/").expect("test tree pattern should compile"));

static TEMP_CLONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/heal_[^/]+/(.*)").expect("temp clone pattern should compile"));

/// Mount point used by the container sandbox.
pub const SANDBOX_WORKDIR: &str = "/workspace/";

/// True when `path` follows a test-file naming convention. Such files are never edited.
pub fn is_test_file(path: &str) -> bool {
    let path = to_forward_slashes(path);
    TEST_FILE_RES.iter().any(|re| re.is_match(&path))
}

/// True when `path` lies anywhere inside a test tree (`test/`, `tests/`) or is a test file.
pub fn is_in_test_tree(path: &str) -> bool {
    let path = to_forward_slashes(path);
    is_test_file(&path) || TEST_TREE_RE.is_match(&path)
}

/// True for references that never point at project source: bundled libraries,
/// system paths, and pseudo-files such as `<string>`.
pub fn is_external_reference(path: &str) -> bool {
    path.contains("/site-packages/")
        || path.contains("/node_modules/")
        || path.starts_with("/usr/")
        || path.starts_with('<')
}

/// Normalize a path reported in a log relative to the repository root.
///
/// Strips the sandbox mount prefix, the repository prefix, and any leading `./`.
pub fn normalize_reported_path(raw: &str, repo_root: Option<&str>) -> String {
    let mut path = to_forward_slashes(raw.trim());
    if let Some(rest) = path.strip_prefix(SANDBOX_WORKDIR) {
        path = rest.to_string();
    }
    if let Some(root) = repo_root {
        let root = to_forward_slashes(root);
        let root = root.trim_end_matches('/');
        if !root.is_empty()
            && let Some(rest) = path.strip_prefix(root)
            && let Some(rest) = rest.strip_prefix('/')
        {
            path = rest.to_string();
        }
    }
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    path
}

/// Strip a temporary clone prefix (`.../heal_<id>/`) for display in exported documents.
pub fn display_path(path: &str) -> String {
    let path = to_forward_slashes(path);
    match TEMP_CLONE_RE.captures(&path) {
        Some(caps) => caps[1].to_string(),
        None => path,
    }
}

/// Final `/`-separated component of `path`.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}
