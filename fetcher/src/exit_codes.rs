//! Stable exit codes for fetcher CLI commands.

use crate::core::types::FetchStatus;

/// Command succeeded; for `run`, the result was validated by the critic.
pub const OK: i32 = 0;
/// Invalid config or request, or a terminal model failure.
pub const ERROR: i32 = 1;
/// `fetcher run` returned a best-effort result that was not validated.
pub const FALLBACK: i32 = 2;
/// `fetcher run` ended without any result.
pub const NO_RESULT: i32 = 3;

pub fn for_status(status: FetchStatus) -> i32 {
    match status {
        FetchStatus::Validated => OK,
        FetchStatus::Fallback => FALLBACK,
        FetchStatus::NoResult => NO_RESULT,
    }
}
