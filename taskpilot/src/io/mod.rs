//! Filesystem, git and subprocess adapters.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod fsutil;
pub mod git;
pub mod history;
pub mod init;
pub mod lease;
pub mod process;
pub mod prompt;
pub mod task_store;
pub mod watch;
