//! Deterministic patch rules.
//!
//! Every rule takes the file as a slice of lines (no terminators) plus the
//! bug being fixed and returns the complete new line sequence, or `None` when
//! the rule does not apply. Rules never look beyond the file they are given.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{BugRecord, Strategy};

/// Output of a successful rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFix {
    pub lines: Vec<String>,
    pub description: String,
}

static UNUSED_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)['"]([^'"]+)['"].*imported but unused"#)
        .expect("unused import pattern should compile")
});
static UNUSED_PLAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)unused import:?\s*['"]?(\S+)['"]?"#)
        .expect("unused import pattern should compile")
});
static FROM_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(from\s+\S+\s+import\s+)(.*)").expect("from import pattern should compile")
});
static NOT_A_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\.(\w+)\s+is not a function.*is a number")
        .expect("type error pattern should compile")
});
static DIVISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\S+)\s*/\s*(\S+)").expect("division pattern should compile"));
static ASSIGN_TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+(?:\[\S+\])?)\s*=").expect("assignment pattern should compile")
});
static CONST_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\[(\d+)\]").expect("index pattern should compile"));
static DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^def\s+(\w+)\s*\((\w+)").expect("def pattern should compile"));
static RECURSIVE_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\s*\((\w+)\s*-").expect("recursive call pattern should compile")
});

/// Apply the deterministic rule named by `strategy` to `lines`.
pub fn apply_rule(strategy: Strategy, lines: &[String], bug: &BugRecord) -> Option<RuleFix> {
    let line_no = bug.line as usize;
    if line_no < 1 || line_no > lines.len() {
        return None;
    }
    let idx = line_no - 1;
    match strategy {
        Strategy::DeterministicIndent => fix_indentation(lines, idx),
        Strategy::DeterministicColon => append_terminator(lines, idx, ':', "colon"),
        Strategy::DeterministicSemicolon => append_terminator(lines, idx, ';', "semicolon"),
        Strategy::DeterministicBracket => close_brackets(lines, idx),
        Strategy::DeterministicUnusedImport => remove_unused_import(lines, idx, &bug.message),
        Strategy::DeterministicTypeError => wrap_number_receiver(lines, idx, &bug.message),
        Strategy::DeterministicLogic => swap_operator(lines, idx, &bug.message),
        Strategy::DeterministicZeroDivision => guard_zero_division(lines, idx),
        Strategy::DeterministicIndexError => guard_index(lines, idx),
        Strategy::DeterministicRecursionError => guard_recursion(lines, idx),
        Strategy::Llm | Strategy::SkipTestFile | Strategy::Unresolvable => None,
    }
}

/// Opening minus closing counts for `()`, `[]`, `{}` on one line.
pub fn unbalanced_brackets(line: &str) -> (i64, i64, i64) {
    let count = |c: char| line.matches(c).count() as i64;
    (count('(') - count(')'), count('[') - count(']'), count('{') - count('}'))
}

/// The closing suffix that balances `line`, or empty.
pub fn closing_suffix(line: &str) -> String {
    let (paren, square, curly) = unbalanced_brackets(line);
    let mut suffix = String::new();
    suffix.push_str(&")".repeat(paren.max(0) as usize));
    suffix.push_str(&"]".repeat(square.max(0) as usize));
    suffix.push_str(&"}".repeat(curly.max(0) as usize));
    suffix
}

fn append_terminator(
    lines: &[String],
    idx: usize,
    terminator: char,
    name: &str,
) -> Option<RuleFix> {
    let stripped = lines[idx].trim_end();
    if stripped.ends_with(terminator) {
        return None;
    }
    let mut out = lines.to_vec();
    out[idx] = format!("{stripped}{terminator}");
    Some(RuleFix {
        lines: out,
        description: format!("Added missing {name} at line {}", idx + 1),
    })
}

fn close_brackets(lines: &[String], idx: usize) -> Option<RuleFix> {
    let stripped = lines[idx].trim_end();
    let suffix = closing_suffix(stripped);
    if suffix.is_empty() {
        return None;
    }
    let mut out = lines.to_vec();
    out[idx] = format!("{stripped}{suffix}");
    Some(RuleFix {
        lines: out,
        description: format!("Added missing bracket(s) '{suffix}' at line {}", idx + 1),
    })
}

fn remove_unused_import(lines: &[String], idx: usize, message: &str) -> Option<RuleFix> {
    let line_no = idx + 1;
    let original = &lines[idx];
    let stripped = original.trim();
    let delete_line = |description: String| {
        let mut out = lines.to_vec();
        out.remove(idx);
        Some(RuleFix {
            lines: out,
            description,
        })
    };

    let unused = UNUSED_QUOTED_RE
        .captures(message)
        .or_else(|| UNUSED_PLAIN_RE.captures(message))
        .map(|caps| caps[1].to_string());
    let Some(unused) = unused else {
        return delete_line(format!("Removed unused import line {line_no}"));
    };

    if stripped.starts_with("import ") && stripped.ends_with(';') {
        return delete_line(format!("Removed unused Java import '{unused}' at line {line_no}"));
    }

    let simple = unused.rsplit('.').next().unwrap_or(&unused).to_string();
    let keep = |names: &str| -> Vec<String> {
        names
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| *n != simple && *n != unused)
            .collect()
    };
    let pad = leading_whitespace(original);

    if stripped.starts_with("from ")
        && stripped.contains("import ")
        && let Some(caps) = FROM_IMPORT_RE.captures(stripped)
    {
        let remaining = keep(&caps[2]);
        if remaining.is_empty() {
            return delete_line(format!("Removed unused import line {line_no}"));
        }
        let mut out = lines.to_vec();
        out[idx] = format!("{pad}{}{}", &caps[1], remaining.join(", "));
        return Some(RuleFix {
            lines: out,
            description: format!("Removed '{unused}' from import at line {line_no}"),
        });
    }

    if let Some(names) = stripped.strip_prefix("import ") {
        let remaining = keep(names.trim());
        if remaining.is_empty() {
            return delete_line(format!("Removed unused import '{unused}' at line {line_no}"));
        }
        let mut out = lines.to_vec();
        out[idx] = format!("{pad}import {}", remaining.join(", "));
        return Some(RuleFix {
            lines: out,
            description: format!("Removed '{unused}' from import at line {line_no}"),
        });
    }

    delete_line(format!("Removed unused import line {line_no}"))
}

fn wrap_number_receiver(lines: &[String], idx: usize, message: &str) -> Option<RuleFix> {
    let caps = NOT_A_FUNCTION_RE.captures(message)?;
    let (var, method) = (&caps[1], &caps[2]);
    let original = &lines[idx];
    let needle = format!("{var}.{method}(");
    let replaced = original.replace(&needle, &format!("String({var}).{method}("));
    if replaced == *original {
        return None;
    }
    let mut out = lines.to_vec();
    out[idx] = replaced;
    Some(RuleFix {
        lines: out,
        description: format!(
            "Wrapped '{var}' in String() before .{method}() at line {}",
            idx + 1
        ),
    })
}

fn swap_operator(lines: &[String], idx: usize, message: &str) -> Option<RuleFix> {
    const OPS: [(&str, &str); 4] = [
        ("multiply", "*"),
        ("divide", "/"),
        ("add", "+"),
        ("subtract", "-"),
    ];
    let lower = message.to_lowercase();
    let mut wanted = None;
    let mut wrong = None;
    for (name, op) in OPS {
        if lower.contains(&format!("should {name}")) {
            wanted = Some(op);
        }
        if lower.contains(&format!("not {name}")) {
            wrong = Some(op);
        }
    }
    let (wanted, wrong) = (wanted?, wrong?);
    if wanted == wrong {
        return None;
    }
    let original = &lines[idx];
    let replaced = original.replacen(&format!(" {wrong} "), &format!(" {wanted} "), 1);
    if replaced == *original {
        return None;
    }
    let mut out = lines.to_vec();
    out[idx] = replaced;
    Some(RuleFix {
        lines: out,
        description: format!("Changed '{wrong}' to '{wanted}' at line {}", idx + 1),
    })
}

fn guard_zero_division(lines: &[String], idx: usize) -> Option<RuleFix> {
    let line_no = idx + 1;
    let original = &lines[idx];
    let pad = leading_whitespace(original);
    let stripped = original.trim();
    let caps = DIVISION_RE.captures(stripped)?;
    let divisor = caps[2].trim_end_matches([',', ';', ':']).to_string();
    let unit = indent_string(lines);
    let mut out = lines.to_vec();

    let guard = if stripped.starts_with("return ") {
        vec![
            format!("{pad}if {divisor} == 0:"),
            format!("{pad}{unit}return 0"),
        ]
    } else if let Some(caps) = ASSIGN_TARGET_RE.captures(stripped) {
        let target = caps[1].to_string();
        if !inside_loop(lines, idx) {
            out.splice(
                idx..=idx,
                [
                    format!("{pad}if {divisor} == 0:"),
                    format!("{pad}{unit}{target} = 0"),
                    format!("{pad}else:"),
                    format!("{pad}{unit}{stripped}"),
                ],
            );
            return Some(RuleFix {
                lines: out,
                description: format!("Added zero-division guard at line {line_no}"),
            });
        }
        vec![
            format!("{pad}if {divisor} == 0:"),
            format!("{pad}{unit}{target} = 0"),
            format!("{pad}{unit}continue"),
        ]
    } else {
        vec![
            format!("{pad}if {divisor} == 0:"),
            format!("{pad}{unit}pass"),
        ]
    };

    out.splice(idx..idx, guard);
    Some(RuleFix {
        lines: out,
        description: format!("Added zero-division guard before line {line_no}"),
    })
}

/// Scan up to nine lines above `idx` for an enclosing `for`/`while`, stopping at
/// the first dedented statement.
fn inside_loop(lines: &[String], idx: usize) -> bool {
    let indent = indent_width(&lines[idx]);
    for line in lines[idx.saturating_sub(9)..idx].iter().rev() {
        let stripped = line.trim();
        if stripped.starts_with("for ") || stripped.starts_with("while ") {
            return true;
        }
        if !stripped.is_empty() && !stripped.starts_with('#') && indent_width(line) < indent {
            return false;
        }
    }
    false
}

fn guard_index(lines: &[String], idx: usize) -> Option<RuleFix> {
    let line_no = idx + 1;
    let original = &lines[idx];
    let pad = leading_whitespace(original);
    let indent = indent_width(original);
    let unit = indent_string(lines);
    let mut out = lines.to_vec();

    if let Some(caps) = CONST_INDEX_RE.captures(original.trim()) {
        let (var, index) = (caps[1].to_string(), caps[2].to_string());
        let guard = [
            format!("{pad}if len({var}) <= {index}:"),
            format!("{pad}{unit}continue"),
        ];
        out.splice(idx..idx, guard);
        return Some(RuleFix {
            lines: out,
            description: format!("Added bounds check for {var}[{index}] at line {line_no}"),
        });
    }

    let mut block_end = idx + 1;
    while block_end < lines.len()
        && !lines[block_end].trim().is_empty()
        && indent_width(&lines[block_end]) >= indent
    {
        block_end += 1;
    }
    let mut wrapped = Vec::with_capacity(block_end - idx + 3);
    wrapped.push(format!("{pad}try:"));
    wrapped.extend(lines[idx..block_end].iter().map(|l| format!("{unit}{l}")));
    wrapped.push(format!("{pad}except (IndexError, KeyError):"));
    wrapped.push(format!("{pad}{unit}continue"));
    out.splice(idx..block_end, wrapped);
    Some(RuleFix {
        lines: out,
        description: format!("Wrapped line {line_no} in try/except for IndexError"),
    })
}

fn guard_recursion(lines: &[String], idx: usize) -> Option<RuleFix> {
    let line_no = idx + 1;
    let original = &lines[idx];
    let pad = leading_whitespace(original);
    let unit = indent_string(lines);

    let param = lines[idx.saturating_sub(19)..idx]
        .iter()
        .rev()
        .find_map(|l| DEF_RE.captures(l.trim()).map(|c| c[2].to_string()))
        .or_else(|| {
            RECURSIVE_CALL_RE
                .captures(original.trim())
                .map(|c| c[2].to_string())
        })
        .unwrap_or_else(|| "n".to_string());

    let mut insert_at = idx;
    for i in (idx.saturating_sub(4)..idx).rev() {
        let stripped = lines[i].trim();
        let guards_param = stripped.starts_with(&format!("if {param} =="))
            || stripped.starts_with(&format!("if {param}=="));
        if guards_param {
            let returns = |j: &usize| lines[*j].trim().starts_with("return");
            if let Some(j) = (i + 1..(i + 3).min(lines.len())).find(returns) {
                insert_at = j + 1;
            }
            break;
        }
    }

    let mut out = lines.to_vec();
    let guard = [
        format!("{pad}if {param} < 0:"),
        format!("{pad}{unit}return 1"),
    ];
    out.splice(insert_at..insert_at, guard);
    Some(RuleFix {
        lines: out,
        description: format!("Added negative-input guard for {param} at line {line_no}"),
    })
}

fn fix_indentation(lines: &[String], idx: usize) -> Option<RuleFix> {
    if idx == 0 {
        return None;
    }
    let prev = lines[..idx].iter().rev().find(|l| !l.trim().is_empty())?;
    let prev_indent = indent_width(prev);
    let opens_block = prev.trim_end().ends_with(':');
    let expected = if opens_block {
        prev_indent + indent_unit(lines)
    } else {
        prev_indent
    };
    let current = &lines[idx];
    let current_indent = indent_width(current);
    let line_no = idx + 1;

    let mut out = lines.to_vec();
    if opens_block && current_indent <= prev_indent {
        out.insert(idx, format!("{}pass", " ".repeat(expected)));
        return Some(RuleFix {
            lines: out,
            description: format!("Inserted missing block body before line {line_no}"),
        });
    }
    if current_indent == expected {
        return None;
    }
    out[idx] = format!("{}{}", " ".repeat(expected), current.trim_start());
    Some(RuleFix {
        lines: out,
        description: format!("Fixed indentation at line {line_no}"),
    })
}

/// Most common positive step between distinct indent widths; 4 when unknown.
pub fn indent_unit(lines: &[String]) -> usize {
    let mut widths: BTreeMap<usize, usize> = BTreeMap::new();
    for line in lines {
        let body = line.trim_start();
        if body.is_empty() || body.starts_with('#') {
            continue;
        }
        let width = indent_width(line);
        if width > 0 {
            *widths.entry(width).or_default() += 1;
        }
    }
    let sorted: Vec<usize> = widths.keys().copied().collect();
    let Some(&smallest) = sorted.first() else {
        return 4;
    };

    let mut diffs: BTreeMap<usize, usize> = BTreeMap::new();
    for pair in sorted.windows(2) {
        *diffs.entry(pair[1] - pair[0]).or_default() += 1;
    }
    // Highest count wins; ties go to the smaller step.
    diffs
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(step, _)| step)
        .unwrap_or(smallest)
}

/// One indentation level: a tab when the file uses tabs, else `indent_unit` spaces.
pub fn indent_string(lines: &[String]) -> String {
    if lines.iter().any(|l| l.starts_with('\t')) {
        return "\t".to_string();
    }
    " ".repeat(indent_unit(lines))
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn leading_whitespace(line: &str) -> &str {
    &line[..indent_width(line)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Category;

    fn src(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn bug(line: u32, category: Category, message: &str) -> BugRecord {
        BugRecord::new("src/app.py", line, category, message)
    }

    #[test]
    fn colon_rule_appends_colon_only() {
        let lines = src("def add(a, b)\n    return a + b");
        let bug = bug(1, Category::Syntax, "expected ':'");
        let fix = apply_rule(Strategy::DeterministicColon, &lines, &bug).expect("fix");
        assert_eq!(fix.lines, src("def add(a, b):\n    return a + b"));
        assert_eq!(fix.description, "Added missing colon at line 1");
    }

    #[test]
    fn colon_rule_declines_when_already_present() {
        let lines = src("def add(a, b):");
        let bug = bug(1, Category::Syntax, "");
        assert!(apply_rule(Strategy::DeterministicColon, &lines, &bug).is_none());
    }

    #[test]
    fn out_of_range_line_declines() {
        let lines = src("x = 1");
        for line in [0, 5] {
            let bug = bug(line, Category::Syntax, "");
            assert!(apply_rule(Strategy::DeterministicColon, &lines, &bug).is_none());
        }
    }

    #[test]
    fn bracket_rule_closes_each_kind() {
        let lines = src("items = foo([1, {2");
        let bug = bug(1, Category::Syntax, "");
        let fix = apply_rule(Strategy::DeterministicBracket, &lines, &bug).expect("fix");
        assert_eq!(fix.lines[0], "items = foo([1, {2)]}");
    }

    #[test]
    fn unused_import_removes_single_name_from_list() {
        let lines = src("from os import path, sep\nimport sys");
        let bug = bug(1, Category::Linting, "F401 'os.sep' imported but unused");
        let fix = apply_rule(Strategy::DeterministicUnusedImport, &lines, &bug).expect("fix");
        assert_eq!(fix.lines, src("from os import path\nimport sys"));
    }

    #[test]
    fn unused_import_deletes_whole_line() {
        let lines = src("import os\nx = 1");
        let message = "unused import: 'os' imported but unused";
        let bug = bug(1, Category::Linting, message);
        let fix = apply_rule(Strategy::DeterministicUnusedImport, &lines, &bug).expect("fix");
        assert_eq!(fix.lines, src("x = 1"));
    }

    #[test]
    fn type_error_wraps_receiver() {
        let lines = src("  return age.toUpperCase();");
        let message = "TypeError: age.toUpperCase is not a function (age is a number)";
        let bug = bug(1, Category::TypeError, message);
        let fix = apply_rule(Strategy::DeterministicTypeError, &lines, &bug).expect("fix");
        assert_eq!(fix.lines[0], "  return String(age).toUpperCase();");
    }

    #[test]
    fn logic_rule_swaps_first_operator() {
        let lines = src("    total = price / tax / 1");
        let message = "LogicError: should multiply tax, not divide";
        let bug = bug(1, Category::Logic, message);
        let fix = apply_rule(Strategy::DeterministicLogic, &lines, &bug).expect("fix");
        assert_eq!(fix.lines[0], "    total = price * tax / 1");
    }

    #[test]
    fn zero_division_guards_return() {
        let lines = src("def divide(a, b):\n    return a / b");
        let bug = bug(2, Category::Logic, "ZeroDivisionError");
        let fix = apply_rule(Strategy::DeterministicZeroDivision, &lines, &bug).expect("fix");
        assert_eq!(
            fix.lines,
            src("def divide(a, b):\n    if b == 0:\n        return 0\n    return a / b")
        );
    }

    #[test]
    fn zero_division_assignment_outside_loop_uses_else() {
        let lines = src("def ratio(a, b):\n    r = a / b\n    return r");
        let bug = bug(2, Category::Logic, "ZeroDivisionError");
        let fix = apply_rule(Strategy::DeterministicZeroDivision, &lines, &bug).expect("fix");
        let expected = [
            "def ratio(a, b):",
            "    if b == 0:",
            "        r = 0",
            "    else:",
            "        r = a / b",
            "    return r",
        ];
        assert_eq!(fix.lines, expected);
    }

    #[test]
    fn zero_division_assignment_in_loop_continues() {
        let lines = src("for x in xs:\n    r = 1 / x\n    out.append(r)");
        let bug = bug(2, Category::Logic, "ZeroDivisionError");
        let fix = apply_rule(Strategy::DeterministicZeroDivision, &lines, &bug).expect("fix");
        let expected = [
            "for x in xs:",
            "    if x == 0:",
            "        r = 0",
            "        continue",
            "    r = 1 / x",
            "    out.append(r)",
        ];
        assert_eq!(fix.lines, expected);
    }

    #[test]
    fn index_rule_adds_bounds_check() {
        let lines = src("for line in rows:\n    name = parts[1]");
        let bug = bug(2, Category::Logic, "IndexError");
        let fix = apply_rule(Strategy::DeterministicIndexError, &lines, &bug).expect("fix");
        assert_eq!(
            fix.lines,
            src("for line in rows:\n    if len(parts) <= 1:\n        continue\n    name = parts[1]")
        );
    }

    #[test]
    fn index_rule_wraps_block_without_constant_index() {
        let lines = src("for k in keys:\n    v = table[k]\n    use(v)\n\nend()");
        let bug = bug(2, Category::Logic, "KeyError");
        let fix = apply_rule(Strategy::DeterministicIndexError, &lines, &bug).expect("fix");
        let expected = [
            "for k in keys:",
            "    try:",
            "        v = table[k]",
            "        use(v)",
            "    except (IndexError, KeyError):",
            "        continue",
            "",
            "end()",
        ];
        assert_eq!(fix.lines, expected);
    }

    #[test]
    fn recursion_guard_goes_after_base_case() {
        let source = "def fact(n):\n    if n == 0:\n        return 1\n    return n * fact(n - 1)";
        let lines = src(source);
        let bug = bug(4, Category::Logic, "RecursionError");
        let fix = apply_rule(Strategy::DeterministicRecursionError, &lines, &bug).expect("fix");
        let expected = [
            "def fact(n):",
            "    if n == 0:",
            "        return 1",
            "    if n < 0:",
            "        return 1",
            "    return n * fact(n - 1)",
        ];
        assert_eq!(fix.lines, expected);
    }

    #[test]
    fn indentation_rule_realigns_line() {
        let lines = src("def f():\n    a = 1\n      b = 2");
        let bug = bug(3, Category::Indentation, "");
        let fix = apply_rule(Strategy::DeterministicIndent, &lines, &bug).expect("fix");
        assert_eq!(fix.lines[2], "    b = 2");
    }

    #[test]
    fn indentation_rule_inserts_pass_for_empty_block() {
        let lines = src("if ready:\nrun()");
        let bug = bug(2, Category::Indentation, "");
        let fix = apply_rule(Strategy::DeterministicIndent, &lines, &bug).expect("fix");
        assert_eq!(fix.lines, src("if ready:\n    pass\nrun()"));
    }

    #[test]
    fn indent_detection_prefers_common_step_and_tabs() {
        assert_eq!(indent_unit(&src("a\n  b\n    c\n      d")), 2);
        assert_eq!(indent_unit(&src("a\nb")), 4);
        assert_eq!(indent_string(&src("a\n\tb")), "\t");
    }
}
