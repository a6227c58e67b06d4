//! Stable exit codes for `promoter` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input (steps, config, unknown kind) or any other failure.
pub const INVALID: i32 = 1;
