//! Per-phase artifacts under `.taskpilot/artifacts/<task-id>/`.
//!
//! `<phase>[-<iteration>].md` records the outcome and summary of one phase
//! attempt; `<phase>[-<iteration>].log` holds the full agent output when
//! enabled. History reconstruction reads these back.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::fsutil::write_atomic;
use crate::core::reconcile::{ArtifactIndex, artifact_stem, parse_artifact_stem};
use crate::core::record::PhaseEntry;
use crate::core::types::PhaseStatus;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }

    /// Remove the previous run's artifacts so iteration numbers start fresh.
    pub fn reset(&self, task_id: &str) -> Result<()> {
        let dir = self.task_dir(task_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
        }
    }

    pub fn log_path(&self, task_id: &str, entry: &PhaseEntry) -> PathBuf {
        self.task_dir(task_id)
            .join(format!("{}.log", artifact_stem(entry.phase, entry.iteration)))
    }

    /// Write the outcome artifact for one phase attempt.
    pub fn write(&self, task_id: &str, entry: &PhaseEntry, detail: &str) -> Result<PathBuf> {
        let stem = artifact_stem(entry.phase, entry.iteration);
        let path = self.task_dir(task_id).join(format!("{stem}.md"));
        let heading = match entry.iteration {
            Some(i) => format!("# {} (iteration {i})", entry.phase),
            None => format!("# {}", entry.phase),
        };
        let body = format!(
            "{heading}\n\n- status: {}\n- duration_ms: {}\n\n## Summary\n\n{}\n",
            entry.status,
            entry.duration_ms,
            detail.trim()
        );
        write_atomic(&path, body.as_bytes())?;
        debug!(path = %path.display(), "phase artifact written");
        Ok(path)
    }

    /// Artifacts on disk for `task_id`, with the status each one records.
    pub fn index(&self, task_id: &str) -> Result<ArtifactIndex> {
        let dir = self.task_dir(task_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ArtifactIndex::new());
            }
            Err(err) => return Err(err).with_context(|| format!("read dir {}", dir.display())),
        };

        let mut index = ArtifactIndex::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read dir entry {}", dir.display()))?
                .path();
            if path.extension().is_none_or(|ext| ext != "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if parse_artifact_stem(stem).is_none() {
                continue;
            }
            let status = fs::read_to_string(&path)
                .ok()
                .and_then(|body| parse_status(&body));
            index.insert(stem.to_string(), status);
        }
        Ok(index)
    }
}

fn parse_status(body: &str) -> Option<PhaseStatus> {
    let value = body
        .lines()
        .find_map(|line| line.trim().strip_prefix("- status:"))?
        .trim();
    serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
}
