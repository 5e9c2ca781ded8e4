//! Run artifacts under `.healer/runs/<run_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::result::ResultDocument;
use crate::io::config::HEALER_DIR;
use crate::looping::IterationReport;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub result_path: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, run_id: &str) -> Self {
        let dir = root.join(HEALER_DIR).join("runs").join(run_id);
        Self {
            result_path: dir.join("result.json"),
            dir,
        }
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir.join(iteration.to_string())
    }

    pub fn report_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("report.json")
    }
}

/// Write one `report.json` per iteration plus the run's `result.json`.
pub fn write_run(
    root: &Path,
    run_id: &str,
    reports: &[IterationReport],
    result: &ResultDocument,
) -> Result<RunPaths> {
    let paths = RunPaths::new(root, run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    for report in reports {
        let dir = paths.iteration_dir(report.iteration);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create iteration dir {}", dir.display()))?;
        write_json(&paths.report_path(report.iteration), report)?;
    }
    write_text(&paths.result_path, &result.to_pretty_json()?)?;

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::RunMemory;
    use crate::core::result::{RunIdentity, ScoreRules, build_result};
    use crate::core::types::Verdict;

    fn report(iteration: u32) -> IterationReport {
        IterationReport {
            iteration,
            tool_results: Vec::new(),
            bugs_found: 1,
            patches_applied: 1,
            commit_sha: format!("c{iteration:06}"),
            ci_conclusion: "success".to_string(),
            all_passed: iteration == 2,
            verdict: Some(Verdict::Pass),
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn document() -> ResultDocument {
        let identity = RunIdentity {
            repository_url: "https://github.com/acme/widgets".to_string(),
            branch: "ACME_ALICE_AI_Fix".to_string(),
            team_name: "acme".to_string(),
            leader_name: "alice".to_string(),
            runtime_seconds: 1.0,
            generated_at: "2026-01-01T00:00:00+00:00".to_string(),
        };
        build_result(&RunMemory::new(), &identity, &ScoreRules::default())
    }

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-1");

        assert!(paths.dir.ends_with(Path::new(".healer/runs/run-1")));
        assert!(paths.result_path.ends_with("run-1/result.json"));
        let report = paths.report_path(3);
        assert!(report.ends_with(Path::new("run-1/3/report.json")));
    }

    #[test]
    fn writes_reports_and_result_with_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let doc = document();
        let reports = [report(1), report(2)];
        let paths = write_run(temp.path(), "run-9", &reports, &doc).expect("write run");

        assert!(paths.report_path(1).is_file());
        assert!(paths.report_path(2).is_file());
        let result = fs::read_to_string(&paths.result_path).expect("read result");
        assert!(result.ends_with("}\n"));
        let parsed: ResultDocument = serde_json::from_str(&result).expect("parse result");
        assert_eq!(parsed, doc);

        let report_json = fs::read_to_string(paths.report_path(2)).expect("read report");
        let value: serde_json::Value = serde_json::from_str(&report_json).expect("parse report");
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["verdict"], "pass");
    }
}
