//! Stable exit codes for synthloop CLI commands.

/// Command succeeded: the session matched, the comparison matched or every check passed.
pub const OK: i32 = 0;
/// Invalid config/target or a fatal error such as an unreadable reference.
pub const INVALID: i32 = 1;
/// The session exhausted its attempts, the comparison mismatched or a check failed.
pub const FAILED: i32 = 2;
