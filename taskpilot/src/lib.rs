//! Autonomous task execution engine for coding agents.
//!
//! A scheduler picks one eligible task at a time from a file-backed task
//! board, drives an external coding agent through PLAN, CODE, REVIEW, TEST
//! and SCOPE phases, and ties a git branch lifecycle to the outcome.
//!
//! - **[`core`]**: Pure, deterministic logic (marker parsing, dependency
//!   resolution, retry policy, history reconciliation). No I/O.
//! - **[`io`]**: Side-effecting adapters (task store, git, agent subprocesses,
//!   history, prompts, configuration).
//!
//! Orchestration modules ([`engine`], [`vcs`], [`scheduler`], [`start`],
//! [`control`]) combine the two to implement the CLI commands.

pub mod control;
pub mod core;
pub mod engine;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod start;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod vcs;
