//! Iteration and commit budgets for the reasoning loop.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_MAX_COMMITS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub max_iterations: u32,
    pub max_commits: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_commits: DEFAULT_MAX_COMMITS,
        }
    }
}

/// Which ceiling stopped the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStop {
    Iterations { used: u32, max: u32 },
    Commits { used: u32, max: u32 },
}

impl Budgets {
    /// True when `iteration` (1-based) is the last one allowed.
    pub fn is_last_iteration(&self, iteration: u32) -> bool {
        iteration >= self.max_iterations
    }

    /// Check both ceilings after an iteration completes.
    pub fn exhausted(&self, iterations_used: u32, commits_used: u32) -> Option<BudgetStop> {
        if commits_used >= self.max_commits {
            return Some(BudgetStop::Commits {
                used: commits_used,
                max: self.max_commits,
            });
        }
        if iterations_used >= self.max_iterations {
            return Some(BudgetStop::Iterations {
                used: iterations_used,
                max: self.max_iterations,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ceilings() {
        let budgets = Budgets::default();
        assert_eq!(budgets.max_iterations, 5);
        assert_eq!(budgets.max_commits, 10);
    }

    #[test]
    fn commit_ceiling_wins_over_iterations() {
        let budgets = Budgets {
            max_iterations: 3,
            max_commits: 2,
        };
        assert_eq!(budgets.exhausted(1, 1), None);
        let stop = budgets.exhausted(2, 2);
        assert_eq!(stop, Some(BudgetStop::Commits { used: 2, max: 2 }));
        let stop = budgets.exhausted(3, 0);
        assert_eq!(stop, Some(BudgetStop::Iterations { used: 3, max: 3 }));
        assert!(budgets.is_last_iteration(3));
        assert!(!budgets.is_last_iteration(2));
    }
}
