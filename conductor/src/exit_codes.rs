//! Stable exit codes for conductor CLI commands.

/// Command succeeded or the run advanced.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/graph/run identity or other
/// errors.
pub const INVALID: i32 = 1;
/// The run completed (`step`/`loop` reached the final station).
pub const COMPLETE: i32 = 2;
/// The run halted for human attention (blocked gate, attempt limit, broken
/// environment).
pub const BLOCKED: i32 = 3;
