//! Stable exit codes for the `patchgate` binary.

/// Input stream ended normally.
pub const OK: i32 = 0;
/// Unrecoverable infrastructure fault: bad config, missing sandbox root,
/// run directory could not be created.
pub const FATAL: i32 = 1;
