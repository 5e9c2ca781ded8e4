//! Deterministic branch naming for healing runs.

/// Suffix appended to every healing branch.
pub const BRANCH_SUFFIX: &str = "AI_Fix";

/// Build `{TEAM}_{LEADER}_AI_Fix` from free-form team and leader names.
pub fn branch_name(team: &str, leader: &str) -> String {
    let team = sanitize_part(team);
    let leader = sanitize_part(leader);
    format!("{team}_{leader}_{BRANCH_SUFFIX}")
}

/// Uppercase, map whitespace and hyphens to `_`, drop everything outside
/// `[A-Z0-9_]`, collapse `_` runs, and trim leading/trailing `_`.
pub fn sanitize_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let mapped = match ch {
            c if c.is_whitespace() || c == '-' => '_',
            c => c.to_ascii_uppercase(),
        };
        if !(mapped.is_ascii_uppercase() || mapped.is_ascii_digit() || mapped == '_') {
            continue;
        }
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}
