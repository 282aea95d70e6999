//! Stable exit codes for hostlink CLI commands.

/// Operation completed and no test failed.
pub const OK: i32 = 0;
/// Invalid config or arguments, or the operation could not be started.
pub const INVALID: i32 = 1;
/// The operation was aborted (test host crashed, disconnected or misbehaved).
pub const ABORTED: i32 = 2;
/// The run completed with at least one failed test.
pub const TESTS_FAILED: i32 = 3;
