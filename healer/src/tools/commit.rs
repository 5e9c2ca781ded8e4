//! `commit_push`: commit the iteration's patches and push the branch.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::path::basename;
use crate::core::result::COMMIT_TAG;
use crate::core::state::{StateKey, StateUpdate, WorkflowState};
use crate::core::types::{AppliedPatch, PushStatus};
use crate::io::git::Vcs;
use crate::tools::{Tool, ToolContext, ToolResult, ToolStatus};

/// Patches listed individually in a commit body.
const MAX_BODY_LINES: usize = 8;

pub struct CommitTool<'a> {
    vcs: &'a dyn Vcs,
    push_enabled: bool,
}

impl<'a> CommitTool<'a> {
    pub fn new(vcs: &'a dyn Vcs, push_enabled: bool) -> Self {
        Self { vcs, push_enabled }
    }
}

/// `[AI-AGENT] Iteration N: K fix(es) applied` plus one body line per patch.
pub fn commit_message(iteration: u32, patches: &[AppliedPatch]) -> String {
    let count = patches.len();
    let mut message = format!("{COMMIT_TAG} Iteration {iteration}: {count} fix(es) applied");
    if patches.is_empty() {
        return message;
    }
    message.push_str("\n\n");
    let mut body: Vec<String> = patches
        .iter()
        .take(MAX_BODY_LINES)
        .map(|p| format!("  - {}: {}", basename(&p.file), p.description))
        .collect();
    if patches.len() > MAX_BODY_LINES {
        body.push(format!("  ... and {} more", patches.len() - MAX_BODY_LINES));
    }
    message.push_str(&body.join("\n"));
    message
}

impl Tool for CommitTool<'_> {
    fn name(&self) -> &'static str {
        "commit_push"
    }

    fn description(&self) -> &'static str {
        "Commits the applied patches with an [AI-AGENT] message and pushes the branch."
    }

    fn inputs(&self) -> &'static [StateKey] {
        &[StateKey::RepoPath, StateKey::Branch]
    }

    fn outputs(&self) -> &'static [StateKey] {
        &[
            StateKey::CommitSha,
            StateKey::CommitMessage,
            StateKey::PushStatus,
        ]
    }

    #[instrument(skip_all, fields(iteration = ctx.iteration))]
    fn execute(&self, state: &WorkflowState, ctx: &ToolContext<'_>) -> Result<ToolResult> {
        let name = self.name();
        let (Some(repo), Some(branch)) = (state.repo_path.as_deref(), state.branch.as_deref())
        else {
            let summary = "No repository or branch.";
            return Ok(ToolResult::new(name, ToolStatus::Skipped, summary));
        };
        let patches = state.applied_patches.as_deref().unwrap_or_default();
        let message = commit_message(ctx.iteration, patches);

        let sha = match self.vcs.commit_all(repo, &message) {
            Ok(Some(sha)) => sha,
            Ok(None) => {
                let skipped = vec![StateUpdate::PushStatus(PushStatus::Skipped)];
                return Ok(ToolResult::new(name, ToolStatus::Skipped, "Nothing to commit.")
                    .with_outputs(skipped));
            }
            Err(err) => {
                let chain = format!("{err:#}");
                warn!(err = %chain, "commit failed");
                let failed = vec![StateUpdate::PushStatus(PushStatus::Failed)];
                return Ok(ToolResult::new(name, ToolStatus::Failure, "Commit failed.")
                    .with_outputs(failed)
                    .with_error(chain));
            }
        };
        info!(sha = %sha, "committed fixes");

        let mut outputs = vec![
            StateUpdate::CommitSha(sha.clone()),
            StateUpdate::CommitMessage(message),
        ];
        if !self.push_enabled {
            outputs.push(StateUpdate::PushStatus(PushStatus::Skipped));
            let summary = format!("Committed {sha}; push disabled.");
            return Ok(ToolResult::new(name, ToolStatus::Success, summary).with_outputs(outputs));
        }
        match self.vcs.push(repo, branch) {
            Ok(()) => {
                outputs.push(StateUpdate::PushStatus(PushStatus::Success));
                let summary = format!("Committed {sha} and pushed {branch}.");
                Ok(ToolResult::new(name, ToolStatus::Success, summary).with_outputs(outputs))
            }
            Err(err) => {
                let chain = format!("{err:#}");
                warn!(err = %chain, "push failed");
                outputs.push(StateUpdate::PushStatus(PushStatus::PushFailed));
                let summary = format!("Committed {sha} but push failed.");
                Ok(ToolResult::new(name, ToolStatus::Failure, summary)
                    .with_outputs(outputs)
                    .with_error(chain))
            }
        }
    }
}
