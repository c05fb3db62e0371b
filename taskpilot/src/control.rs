//! `taskpilot status` and `taskpilot stop`.

use std::fmt;
use std::path::Path;

use anyhow::Result;

use crate::core::types::TaskStatus;
use crate::io::init::EnginePaths;
use crate::io::lease::{running_scheduler, signal_stop};
use crate::io::task_store::{FileTaskStore, TaskStore};
use crate::start::load_project_config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub scheduler_pid: Option<u32>,
    /// Task count per column, in board order.
    pub counts: Vec<(TaskStatus, usize)>,
    pub in_progress: Vec<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheduler_pid {
            Some(pid) => writeln!(f, "scheduler: running (pid {pid})")?,
            None => writeln!(f, "scheduler: stopped")?,
        }
        for (status, count) in &self.counts {
            writeln!(f, "{status:>12}: {count}")?;
        }
        if !self.in_progress.is_empty() {
            writeln!(f, "in progress: {}", self.in_progress.join(", "))?;
        }
        Ok(())
    }
}

pub fn status(root: &Path) -> Result<StatusReport> {
    let paths = EnginePaths::new(root);
    let cfg = load_project_config(&paths)?;
    let store = FileTaskStore::open(paths.tasks_dir(&cfg))?;
    let mut counts = Vec::new();
    let mut in_progress = Vec::new();
    for status in TaskStatus::ALL {
        let tasks = store.list(status)?;
        if status == TaskStatus::InProgress {
            in_progress = tasks.iter().map(|t| t.id.clone()).collect();
        }
        counts.push((status, tasks.len()));
    }
    Ok(StatusReport {
        scheduler_pid: running_scheduler(&paths.pid_path)?,
        counts,
        in_progress,
    })
}

/// Signal the running scheduler. Returns its pid, or `None` if none runs.
pub fn stop(root: &Path) -> Result<Option<u32>> {
    signal_stop(&EnginePaths::new(root).pid_path)
}
