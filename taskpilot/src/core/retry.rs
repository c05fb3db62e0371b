//! Auto-retry policy for failed tasks sitting in `review`.

use chrono::{DateTime, Duration, Utc};

use crate::core::types::{Task, TaskStatus};

/// Retry limits from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// True if `task` should move back to `todo` at `now`.
    ///
    /// Only tasks that failed (carry `last_error`) qualify; a task parked in
    /// `review` by a human or by a clean run stays put.
    pub fn is_due(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Review {
            return false;
        }
        if task.last_error.is_none() || task.retry_count >= self.max_retries {
            return false;
        }
        match task.last_attempt_at {
            Some(at) => now.signed_duration_since(at) >= self.delay,
            None => true,
        }
    }

    /// Ids of every due task, in input order.
    pub fn sweep(&self, tasks: &[Task], now: DateTime<Utc>) -> Vec<String> {
        tasks
            .iter()
            .filter(|t| self.is_due(t, now))
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Stamp a task returned to `todo` by the sweep.
///
/// `retry_count` is left alone: it counts failed runs and is bumped by
/// [`crate::scheduler::apply_report`] when a run fails, not when the task is
/// re-queued, so each failure counts once against `max_retries`.
pub fn mark_retried(task: &mut Task, now: DateTime<Utc>) {
    task.status = TaskStatus::Todo;
    task.retried_at = Some(now);
}
