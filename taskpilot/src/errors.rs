//! Typed errors callers branch on via `anyhow::Error::downcast_ref`.

use std::fmt;

/// No configured agent engine is installed (or the requested one is unknown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoEngineError {
    pub requested: Option<String>,
    pub tried: Vec<String>,
}

impl fmt::Display for NoEngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.requested {
            Some(name) => write!(f, "agent engine '{name}' is not available"),
            None => write!(
                f,
                "no agent engine available (tried: {})",
                self.tried.join(", ")
            ),
        }
    }
}

impl std::error::Error for NoEngineError {}

/// Another live scheduler holds the pid marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyRunningError {
    pub pid: u32,
}

impl fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler already running (pid {})", self.pid)
    }
}

impl std::error::Error for AlreadyRunningError {}

/// Work stopped because the supervisor was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled by stop request")
    }
}

impl std::error::Error for CancelledError {}
