//! Stable exit codes for the `splitstack` binary.

/// Every step committed and no blocking drift.
pub const OK: i32 = 0;
/// Dirty tree, unresolvable branches, bad config, or a rejected plan. Nothing was mutated.
pub const INVALID: i32 = 1;
/// A step exhausted its fix attempts or its agent failed; the run halted on that step's branch.
pub const STEP_FAILED: i32 = 2;
/// `--strict` and the stacked result does not match the original change.
pub const DRIFT: i32 = 3;
/// The operator declined the plan confirmation.
pub const ABORTED: i32 = 4;
