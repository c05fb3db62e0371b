//! Stable exit codes for taskpilot CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid layout/config/arguments or any other error.
pub const INVALID: i32 = 1;
/// No agent engine is installed (or the requested one is unavailable).
pub const NO_ENGINE: i32 = 2;
/// `taskpilot start` found another live scheduler.
pub const ALREADY_RUNNING: i32 = 3;
