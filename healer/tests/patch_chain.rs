//! Classify → plan → patch through the registry, without the loop.
//!
//! These tests feed a raw log into the classifier and chain its outputs into
//! the planner and patch applier exactly as the loop would, then inspect the
//! working tree.

use std::fs;

use healer::core::memory::RunMemory;
use healer::core::state::{StateUpdate, WorkflowState};
use healer::core::types::{Category, SkipStatus, Strategy};
use healer::io::llm::ModelClient;
use healer::test_support::{ScriptedModel, TestRepo};
use healer::tools::classifier::ClassifierTool;
use healer::tools::patcher::PatcherTool;
use healer::tools::planner::PlannerTool;
use healer::tools::{Registry, ToolContext, ToolStatus};

fn registry<'a>(model: Option<&'a ScriptedModel>, max_changed_lines: usize) -> Registry<'a> {
    let model = model.map(|m| m as &dyn ModelClient);
    let mut registry = Registry::new();
    registry
        .register(Box::new(ClassifierTool::new(model)))
        .expect("classifier");
    registry.register(Box::new(PlannerTool)).expect("planner");
    registry
        .register(Box::new(PatcherTool::new(model, max_changed_lines)))
        .expect("patcher");
    registry
}

/// Run the three tools in order, applying outputs between them.
fn run_chain(registry: &Registry<'_>, repo: &TestRepo, log: &str) -> WorkflowState {
    let mut state = WorkflowState::new(repo.path(), None, None);
    state.apply(StateUpdate::TestOutput(log.to_string()));
    let memory = RunMemory::new();
    let ctx = ToolContext {
        iteration: 1,
        max_iterations: 5,
        memory: &memory,
        ci_unavailable: false,
    };
    for name in ["failure_classifier", "fix_planner", "patch_applier"] {
        let missing = registry.missing_inputs(name, &state).expect("known tool");
        assert!(missing.is_empty(), "{name}");
        let result = registry.invoke(name, &state, &ctx).expect("invoke");
        let summary = &result.summary;
        assert_ne!(result.status, ToolStatus::Skipped, "{name}: {summary}");
        state.apply_all(result.outputs);
    }
    state
}

#[test]
fn edits_lower_in_a_file_do_not_shift_earlier_ones() {
    let repo = TestRepo::with_files(&[(
        "src/app.py",
        "import os\nimport sys\n\ndef main()\n    return sys.argv\n",
    )])
    .expect("repo");
    let log = concat!(
        "src/app.py:1:1: F401 'os' imported but unused\n",
        "  File \"src/app.py\", line 4\n",
        "    def main()\n",
        "              ^\n",
        "SyntaxError: expected ':'\n"
    );

    let registry = registry(None, 20);
    let state = run_chain(&registry, &repo, log);

    let applied = state.applied_patches.expect("applied");
    assert_eq!(applied.len(), 2);
    assert_eq!(
        repo.read("src/app.py").expect("read"),
        "import sys\n\ndef main():\n    return sys.argv\n"
    );
}

#[test]
fn overlapping_rules_classify_one_bug_per_location() {
    let repo = TestRepo::with_files(&[("src/app.py", "import os\nx = 1\n")]).expect("repo");
    // flake8 and the generic unused-import rule both match the same line.
    let log = "src/app.py:1:1: F401 'os' imported but unused\n";

    let registry = registry(None, 20);
    let state = run_chain(&registry, &repo, log);

    let bugs = state.classified_bugs.expect("bugs");
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].bug.category, Category::Linting);
    assert_eq!(state.fix_plan.expect("plan").len(), 1);
    assert_eq!(repo.read("src/app.py").expect("read"), "x = 1\n");
}

#[test]
fn test_files_are_planned_as_skips_and_left_untouched() {
    let test_source = "def test_add()\n    assert add(1, 2) == 3\n";
    let repo = TestRepo::with_files(&[
        ("src/app.py", "def add(a, b)\n    return a + b\n"),
        ("tests/test_app.py", test_source),
    ])
    .expect("repo");
    let log = concat!(
        "  File \"tests/test_app.py\", line 1\n",
        "    def test_add()\n",
        "                  ^\n",
        "SyntaxError: expected ':'\n",
        "\n",
        "  File \"src/app.py\", line 1\n",
        "    def add(a, b)\n",
        "                 ^\n",
        "SyntaxError: expected ':'\n"
    );

    let registry = registry(None, 20);
    let state = run_chain(&registry, &repo, log);

    let plan = state.fix_plan.expect("plan");
    let test_entry = plan
        .iter()
        .find(|entry| entry.bug.file == "tests/test_app.py")
        .expect("test entry");
    assert_eq!(test_entry.strategy, Strategy::SkipTestFile);
    let skipped = state.skipped_patches.expect("skipped");
    let test_skip = skipped
        .iter()
        .find(|s| s.bug.file == "tests/test_app.py")
        .expect("test skip");
    assert_eq!(test_skip.status, SkipStatus::SkippedSkipTestFile);
    assert_eq!(repo.read("tests/test_app.py").expect("read"), test_source);
    assert_eq!(
        repo.read("src/app.py").expect("read"),
        "def add(a, b):\n    return a + b\n"
    );
}

#[test]
fn oversized_model_patch_leaves_file_byte_identical() {
    let original: String = (1..=12).map(|n| format!("value_{n} = compute({n})\n")).collect();
    let repo = TestRepo::with_files(&[("src/calc.py", original.as_str())]).expect("repo");
    let replacement: String = (1..=6).map(|n| format!("value_{n} = {n}\n")).collect();
    let reply = format!("<<<<\nvalue_5 = compute(5)\n====\n{replacement}>>>>");
    let model = ScriptedModel::new(vec![Ok(reply)]);
    let log = concat!(
        "  File \"src/calc.py\", line 5, in <module>\n",
        "    value_5 = compute(5)\n",
        "AssertionError: value_5 should be 5\n"
    );

    let registry = registry(Some(&model), 3);
    let state = run_chain(&registry, &repo, log);

    assert!(state.applied_patches.expect("applied").is_empty());
    let skipped = state.skipped_patches.expect("skipped");
    assert_eq!(skipped[0].status, SkipStatus::RejectedChangeCap);
    let after = fs::read_to_string(repo.file("src/calc.py")).expect("read");
    assert_eq!(after, original);
}
