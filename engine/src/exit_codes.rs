//! Stable exit codes for `plan-engine` commands.

use crate::error::EngineError;
use crate::plan_runner::RunOutcome;

/// Plan completed, or a non-run command succeeded.
pub const OK: i32 = 0;
/// Invalid config, plan, status or arguments; nothing was executed.
pub const INVALID: i32 = 1;
/// A task escalated; an issue and a queue entry were recorded.
pub const ESCALATED: i32 = 2;
/// The kill switch halted the run between tasks.
pub const HALTED: i32 = 3;
/// A security violation (sandbox escape, bad signature, missing key).
pub const SECURITY: i32 = 4;

pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { .. } => OK,
        RunOutcome::Escalated { .. } => ESCALATED,
        RunOutcome::Halted { .. } => HALTED,
    }
}

pub fn for_error(err: &EngineError) -> i32 {
    if err.is_security() { SECURITY } else { INVALID }
}
