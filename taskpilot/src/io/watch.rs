//! Wake-ups on task store changes.
//!
//! The scheduler sleeps for the poll interval between cycles; a change under
//! the tasks directory ends the sleep early.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, info};

pub struct TaskWatcher {
    // Dropping the watcher stops polling.
    _watcher: PollWatcher,
    notify: Arc<Notify>,
}

impl TaskWatcher {
    /// Watch `dir` recursively, polling every `interval`.
    pub fn start(dir: &Path, interval: Duration) -> Result<Self> {
        let notify = Arc::new(Notify::new());
        let sender = notify.clone();
        let mut watcher = PollWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res
                    && is_change(&event.kind)
                {
                    debug!(kind = ?event.kind, "task store changed");
                    sender.notify_one();
                }
            },
            notify::Config::default().with_poll_interval(interval),
        )
        .context("create task watcher")?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", dir.display()))?;
        info!(path = %dir.display(), "watching task store");
        Ok(Self {
            _watcher: watcher,
            notify,
        })
    }

    /// Resolves on the next change. A change that happened since the last
    /// call resolves immediately.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_file_wakes_waiter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let watcher =
            TaskWatcher::start(temp.path(), Duration::from_millis(50)).expect("watcher");
        std::fs::write(temp.path().join("t-1.json"), "{}").expect("write");
        tokio::time::timeout(Duration::from_secs(5), watcher.changed())
            .await
            .expect("change observed");
    }

    #[test]
    fn access_events_are_ignored() {
        assert!(!is_change(&EventKind::Access(notify::event::AccessKind::Any)));
        assert!(is_change(&EventKind::Remove(notify::event::RemoveKind::Any)));
    }
}
