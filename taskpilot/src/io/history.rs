//! Execution history store (`.taskpilot/history/<task-id>.json`).
//!
//! Append-only per task and bounded to the most recent records. Reads are
//! self-repairing: records with malformed fields or phase detail are
//! rebuilt from the artifacts on disk and the file is written back. A file
//! that is not a JSON array at all is moved aside as `<id>.json.corrupt-<ts>`
//! before history starts over.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::artifacts::ArtifactStore;
use super::fsutil::write_json_atomic;
use crate::core::reconcile::{ArtifactIndex, RawRecord, reconcile};
use crate::core::record::ExecutionRecord;

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    limit: usize,
    artifacts: ArtifactStore,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, limit: usize, artifacts: ArtifactStore) -> Self {
        Self {
            dir: dir.into(),
            limit: limit.max(1),
            artifacts,
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Append a record, dropping the oldest beyond the limit.
    #[instrument(skip_all, fields(task_id, result = ?record.result))]
    pub fn append(&self, task_id: &str, record: ExecutionRecord) -> Result<()> {
        let mut records = self.read(task_id)?;
        records.push(record);
        if records.len() > self.limit {
            let excess = records.len() - self.limit;
            records.drain(..excess);
        }
        write_json_atomic(&self.path_for(task_id), &records)?;
        debug!(count = records.len(), "history appended");
        Ok(())
    }

    /// All records for `task_id`, oldest first, repairing as needed.
    #[instrument(skip_all, fields(task_id))]
    pub fn read(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        let path = self.path_for(task_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let values: Vec<Value> = match serde_json::from_str(&contents) {
            Ok(values) => values,
            Err(err) => {
                let backup = self.dir.join(format!(
                    "{task_id}.json.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
                ));
                fs::rename(&path, &backup).with_context(|| {
                    format!("move aside {} to {}", path.display(), backup.display())
                })?;
                warn!(path = %path.display(), backup = %backup.display(), err = %err, "unreadable history moved aside, starting over");
                return Ok(Vec::new());
            }
        };

        let index = if values.is_empty() {
            ArtifactIndex::new()
        } else {
            self.artifacts.index(task_id)?
        };
        let mut repaired = 0usize;
        let mut records = Vec::with_capacity(values.len());
        for value in &values {
            let out = reconcile(RawRecord::from_value(value), &index);
            if out.repaired {
                repaired += 1;
            }
            records.push(out.record);
        }

        if repaired > 0 {
            info!(repaired, "history records reconstructed");
            write_json_atomic(&path, &records)?;
        }
        Ok(records)
    }
}
