//! Stable exit codes for healer CLI commands.

use crate::looping::HealStatus;

/// Command succeeded, or `healer run` healed the repository.
pub const OK: i32 = 0;
/// Invalid input, config, or repository, or any other error.
pub const INVALID: i32 = 1;
/// `healer run` applied fixes but the suite is not green.
pub const PARTIAL: i32 = 2;
/// `healer run` applied no fixes and the suite is not green.
pub const FAILED: i32 = 3;

pub fn for_status(status: HealStatus) -> i32 {
    match status {
        HealStatus::Healed => OK,
        HealStatus::Partial => PARTIAL,
        HealStatus::Failed => FAILED,
    }
}
