//! Phase ring and the pure transition function of the reasoning loop.
//!
//! The driver runs the tool bound to the current phase, condenses the result
//! into a [`PhaseOutcome`], and asks [`transition`] where to go next. All
//! state mutation stays in the driver; this module only decides.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{PushStatus, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    RunTests,
    Classify,
    PlanFix,
    ApplyPatch,
    CommitPush,
    WaitForCi,
    FetchCiResults,
    Verify,
    Done,
}

impl Phase {
    /// The eight working phases in ring order.
    pub const RING: [Phase; 8] = [
        Phase::RunTests,
        Phase::Classify,
        Phase::PlanFix,
        Phase::ApplyPatch,
        Phase::CommitPush,
        Phase::WaitForCi,
        Phase::FetchCiResults,
        Phase::Verify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::RunTests => "RUN_TESTS",
            Phase::Classify => "CLASSIFY",
            Phase::PlanFix => "PLAN_FIX",
            Phase::ApplyPatch => "APPLY_PATCH",
            Phase::CommitPush => "COMMIT_PUSH",
            Phase::WaitForCi => "WAIT_FOR_CI",
            Phase::FetchCiResults => "FETCH_CI_RESULTS",
            Phase::Verify => "VERIFY",
            Phase::Done => "DONE",
        }
    }

    /// Name of the tool bound to this phase; `None` for `Done`.
    pub fn tool_name(self) -> Option<&'static str> {
        match self {
            Phase::RunTests => Some("test_runner"),
            Phase::Classify => Some("failure_classifier"),
            Phase::PlanFix => Some("fix_planner"),
            Phase::ApplyPatch => Some("patch_applier"),
            Phase::CommitPush => Some("commit_push"),
            Phase::WaitForCi => Some("wait_for_ci"),
            Phase::FetchCiResults => Some("fetch_ci_results"),
            Phase::Verify => Some("verification"),
            Phase::Done => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver observed after running a phase's tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Required inputs were missing; the tool never ran.
    InputsMissing,
    RunTests {
        ci_already_green: bool,
    },
    Classify {
        bugs_found: usize,
        local_passed: bool,
        stagnated: bool,
    },
    PlanFix {
        actionable: usize,
    },
    ApplyPatch {
        applied: usize,
    },
    CommitPush {
        committed: bool,
        push: Option<PushStatus>,
    },
    WaitForCi {
        completed: bool,
        no_workflow: bool,
        local_fallback_allowed: bool,
    },
    FetchCiResults {
        logs_empty: bool,
    },
    Verify {
        ci_unavailable: bool,
        local_passed: bool,
        all_passed: bool,
        should_continue: bool,
        at_iteration_limit: bool,
        verdict: Option<Verdict>,
    },
}

/// Where the loop goes after a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(Phase),
    /// Stop CI monitoring and verify locally (CI unavailable for this iteration).
    VerifyLocally,
    /// End this iteration and start the next one at `CLASSIFY`.
    Continue,
    Done {
        verdict: Option<Verdict>,
        passed: bool,
    },
}

fn stop(verdict: Verdict) -> Transition {
    Transition::Done {
        verdict: Some(verdict),
        passed: false,
    }
}

fn healed(verdict: Verdict) -> Transition {
    Transition::Done {
        verdict: Some(verdict),
        passed: true,
    }
}

/// Decide the next step after `phase` produced `outcome`.
pub fn transition(phase: Phase, outcome: &PhaseOutcome) -> Transition {
    match (phase, outcome) {
        (_, PhaseOutcome::InputsMissing) => stop(Verdict::InputsMissing),
        (Phase::RunTests, PhaseOutcome::RunTests { ci_already_green }) => {
            if *ci_already_green {
                healed(Verdict::Pass)
            } else {
                Transition::Advance(Phase::Classify)
            }
        }
        (
            Phase::Classify,
            PhaseOutcome::Classify {
                bugs_found,
                local_passed,
                stagnated,
            },
        ) => match (*bugs_found, *local_passed, *stagnated) {
            (0, true, _) => healed(Verdict::Pass),
            (0, false, _) => stop(Verdict::NoBugsClassified),
            (_, _, true) => stop(Verdict::NoNewFailures),
            _ => Transition::Advance(Phase::PlanFix),
        },
        (Phase::PlanFix, PhaseOutcome::PlanFix { actionable }) => {
            if *actionable == 0 {
                stop(Verdict::NoActionableFixes)
            } else {
                Transition::Advance(Phase::ApplyPatch)
            }
        }
        (Phase::ApplyPatch, PhaseOutcome::ApplyPatch { applied }) => {
            if *applied == 0 {
                stop(Verdict::NoPatchesApplied)
            } else {
                Transition::Advance(Phase::CommitPush)
            }
        }
        (Phase::CommitPush, PhaseOutcome::CommitPush { committed, push }) => {
            if !*committed {
                return stop(Verdict::CommitFailed);
            }
            match push {
                Some(PushStatus::Success) => Transition::Advance(Phase::WaitForCi),
                Some(PushStatus::Skipped) => Transition::VerifyLocally,
                _ => stop(Verdict::PushFailedFixesApplied),
            }
        }
        (
            Phase::WaitForCi,
            PhaseOutcome::WaitForCi {
                completed,
                no_workflow,
                local_fallback_allowed,
            },
        ) => {
            if *completed {
                Transition::Advance(Phase::FetchCiResults)
            } else if *no_workflow && !*local_fallback_allowed {
                stop(Verdict::CiNotConfigured)
            } else {
                Transition::VerifyLocally
            }
        }
        (Phase::FetchCiResults, PhaseOutcome::FetchCiResults { logs_empty }) => {
            if *logs_empty {
                stop(Verdict::NoCiLogs)
            } else {
                Transition::Advance(Phase::Verify)
            }
        }
        (
            Phase::Verify,
            PhaseOutcome::Verify {
                ci_unavailable,
                local_passed,
                all_passed,
                should_continue,
                at_iteration_limit,
                verdict,
            },
        ) => {
            if *ci_unavailable {
                return match (*local_passed, *at_iteration_limit) {
                    (true, _) => healed(Verdict::PassLocal),
                    (false, true) => stop(Verdict::FailLocalNoCi),
                    (false, false) => Transition::Continue,
                };
            }
            if *all_passed {
                return healed(verdict.unwrap_or(Verdict::Pass));
            }
            if *should_continue && !*at_iteration_limit {
                return Transition::Continue;
            }
            Transition::Done {
                verdict: *verdict,
                passed: false,
            }
        }
        // An outcome recorded against the wrong phase is a driver bug; stop safely.
        _ => Transition::Done {
            verdict: None,
            passed: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Transition::{Advance, Continue, VerifyLocally};

    #[test]
    fn ring_maps_each_phase_to_a_tool() {
        let names: Vec<_> = Phase::RING.iter().filter_map(|p| p.tool_name()).collect();
        assert_eq!(names.len(), 8);
        assert_eq!(Phase::Done.tool_name(), None);
    }

    #[test]
    fn missing_inputs_stop_any_phase() {
        for phase in Phase::RING {
            assert_eq!(
                transition(phase, &PhaseOutcome::InputsMissing),
                stop(Verdict::InputsMissing)
            );
        }
    }

    #[test]
    fn green_ci_in_memory_short_circuits_run_tests() {
        let run = |ci_already_green| {
            let outcome = PhaseOutcome::RunTests { ci_already_green };
            transition(Phase::RunTests, &outcome)
        };
        assert_eq!(run(true), healed(Verdict::Pass));
        assert_eq!(run(false), Advance(Phase::Classify));
    }

    #[test]
    fn classify_edges() {
        let classify = |bugs_found, local_passed, stagnated| {
            transition(
                Phase::Classify,
                &PhaseOutcome::Classify {
                    bugs_found,
                    local_passed,
                    stagnated,
                },
            )
        };
        assert_eq!(classify(0, true, false), healed(Verdict::Pass));
        assert_eq!(classify(0, false, false), stop(Verdict::NoBugsClassified));
        assert_eq!(classify(2, false, true), stop(Verdict::NoNewFailures));
        assert_eq!(classify(2, false, false), Advance(Phase::PlanFix));
    }

    #[test]
    fn commit_edges() {
        let commit = |committed, push| {
            let outcome = PhaseOutcome::CommitPush { committed, push };
            transition(Phase::CommitPush, &outcome)
        };
        let rejected = Some(PushStatus::PushFailed);
        let pushed = Some(PushStatus::Success);
        assert_eq!(commit(false, None), stop(Verdict::CommitFailed));
        assert_eq!(
            commit(true, rejected),
            stop(Verdict::PushFailedFixesApplied)
        );
        assert_eq!(commit(true, pushed), Advance(Phase::WaitForCi));
        assert_eq!(commit(true, Some(PushStatus::Skipped)), VerifyLocally);
    }

    #[test]
    fn ci_wait_falls_back_or_stops_per_policy() {
        let wait = |completed, no_workflow, local_fallback_allowed| {
            transition(
                Phase::WaitForCi,
                &PhaseOutcome::WaitForCi {
                    completed,
                    no_workflow,
                    local_fallback_allowed,
                },
            )
        };
        assert_eq!(wait(true, false, true), Advance(Phase::FetchCiResults));
        assert_eq!(wait(false, false, false), VerifyLocally);
        assert_eq!(wait(false, true, true), VerifyLocally);
        assert_eq!(wait(false, true, false), stop(Verdict::CiNotConfigured));
    }

    #[test]
    fn verify_edges() {
        use Verdict::{Fail, FailLocalNoCi, Pass, PassLocal};

        let verify = |unavailable, local, all, more, limit| {
            let verdict = if all { Verdict::Pass } else { Verdict::Fail };
            transition(
                Phase::Verify,
                &PhaseOutcome::Verify {
                    ci_unavailable: unavailable,
                    local_passed: local,
                    all_passed: all,
                    should_continue: more,
                    at_iteration_limit: limit,
                    verdict: Some(verdict),
                },
            )
        };
        assert_eq!(verify(true, true, false, false, false), healed(PassLocal));
        assert_eq!(verify(true, false, false, true, false), Continue);
        assert_eq!(verify(true, false, false, true, true), stop(FailLocalNoCi));
        assert_eq!(verify(false, false, true, false, false), healed(Pass));
        assert_eq!(verify(false, false, false, true, false), Continue);
        assert_eq!(verify(false, false, false, true, true), stop(Fail));
        assert_eq!(verify(false, false, false, false, false), stop(Fail));
    }
}
