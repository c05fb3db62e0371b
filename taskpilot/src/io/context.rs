//! Project context file (`.taskpilot/context.md`).
//!
//! Long-lived project memory: every phase prompt includes it and a passing
//! SCOPE phase appends what the task taught.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::fsutil::write_atomic;
use crate::core::types::Task;

#[derive(Debug, Clone)]
pub struct ProjectContext {
    path: PathBuf,
}

impl ProjectContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; empty when the file does not exist.
    pub fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Append a dated section for `task`. Blank notes are skipped.
    pub fn append(&self, task: &Task, notes: &str, at: DateTime<Utc>) -> Result<bool> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Ok(false);
        }
        let mut contents = self.read()?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&format!(
            "\n## {} {}: {}\n\n{notes}\n",
            at.format("%Y-%m-%d"),
            task.id,
            task.title
        ));
        write_atomic(&self.path, contents.as_bytes())?;
        debug!(path = %self.path.display(), task_id = %task.id, "project context appended");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use chrono::TimeZone;

    #[test]
    fn append_adds_dated_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = ProjectContext::new(temp.path().join("context.md"));
        assert_eq!(context.read().expect("read"), "");

        fs::write(context.path(), "# Project context").expect("seed");
        let task = Task::new("t-7", "Add login", TaskStatus::InProgress);
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("date");
        assert!(context.append(&task, "Auth lives in src/auth.rs\n", at).expect("append"));

        assert_eq!(
            context.read().expect("read"),
            "# Project context\n\n## 2026-05-04 t-7: Add login\n\nAuth lives in src/auth.rs\n"
        );
    }

    #[test]
    fn blank_notes_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = ProjectContext::new(temp.path().join("context.md"));
        let task = Task::new("t-1", "x", TaskStatus::InProgress);
        assert!(!context.append(&task, "  \n", Utc::now()).expect("append"));
        assert!(!context.path().exists());
    }
}
