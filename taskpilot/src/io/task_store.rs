//! Task store contract and its file-backed implementation.
//!
//! Layout: `<tasks_dir>/<status>/<id>.json`. The directory a record sits in
//! is authoritative for its status. A status change rewrites the record in
//! place and then renames it, so a crash never leaves the task in two
//! columns. Copies left in several columns by other writers resolve to the
//! most recently modified one, later board columns winning ties.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::fsutil::write_json_atomic;
use crate::core::types::{Task, TaskStatus};

const TASK_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/task.schema.json"
));

/// Storage the scheduler reads tasks from and writes outcomes to.
pub trait TaskStore {
    fn list(&self, status: TaskStatus) -> Result<Vec<Task>>;

    fn list_all(&self) -> Result<Vec<Task>> {
        let mut all = Vec::new();
        for status in TaskStatus::ALL {
            all.extend(self.list(status)?);
        }
        Ok(all)
    }

    fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Store a new task in the column named by `task.status`.
    fn create(&self, task: &Task) -> Result<()>;

    /// Replace a task's record, moving it if `task.status` changed.
    fn update(&self, task: &Task) -> Result<()>;

    /// Move a task to another column and return the updated record.
    fn move_to(&self, id: &str, status: TaskStatus) -> Result<Task>;

    /// Remove a task. Returns false if it did not exist.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// JSON-file task store validated against the bundled task schema.
pub struct FileTaskStore {
    root: PathBuf,
    validator: Validator,
}

impl FileTaskStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let schema: Value = serde_json::from_str(TASK_SCHEMA).context("parse task schema")?;
        let validator = validator_for(&schema).map_err(|err| anyhow!("invalid task schema: {err}"))?;
        for status in TaskStatus::ALL {
            let dir = root.join(status.as_str());
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(Self { root, validator })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str, status: TaskStatus) -> PathBuf {
        self.root.join(status.as_str()).join(format!("{id}.json"))
    }

    /// Current record location, or `None` if the task does not exist.
    fn locate(&self, id: &str) -> Result<Option<(PathBuf, TaskStatus)>> {
        Ok(self.copies(id)?.pop())
    }

    /// Every column holding `id`, oldest first; the last entry is current.
    fn copies(&self, id: &str) -> Result<Vec<(PathBuf, TaskStatus)>> {
        ensure_safe_id(id)?;
        let mut found = Vec::new();
        for (rank, status) in TaskStatus::ALL.into_iter().enumerate() {
            let path = self.path_for(id, status);
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if meta.is_file() {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((modified, rank, path, status));
            }
        }
        found.sort_by_key(|(modified, rank, _, _)| (*modified, *rank));
        Ok(found
            .into_iter()
            .map(|(_, _, path, status)| (path, status))
            .collect())
    }

    /// Parse and validate one record. The directory overrides the stored status.
    fn load(&self, path: &Path, status: TaskStatus) -> Result<Task> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse task {}", path.display()))?;
        if !self.validator.is_valid(&value) {
            let messages = self
                .validator
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(anyhow!(
                "task schema validation failed: {}",
                messages.join("; ")
            ));
        }
        let mut task: Task = serde_json::from_value(value)
            .with_context(|| format!("deserialize task {}", path.display()))?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != task.id {
            return Err(anyhow!(
                "task id '{}' does not match file name '{stem}'",
                task.id
            ));
        }
        task.status = status;
        Ok(task)
    }
}

impl TaskStore for FileTaskStore {
    #[instrument(skip_all, fields(status = %status))]
    fn list(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let dir = self.root.join(status.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read dir {}", dir.display())),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read dir entry {}", dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut tasks = Vec::new();
        for path in paths {
            match self.load(&path, status) {
                Ok(task) => {
                    if let Ok(Some((_, current))) = self.locate(&task.id)
                        && current != status
                    {
                        debug!(task_id = %task.id, current = %current, "skipping stale duplicate");
                        continue;
                    }
                    tasks.push(task);
                }
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping invalid task record"),
            }
        }
        debug!(count = tasks.len(), "listed tasks");
        Ok(tasks)
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        match self.locate(id)? {
            Some((path, status)) => self.load(&path, status).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(id = %task.id, status = %task.status))]
    fn create(&self, task: &Task) -> Result<()> {
        if self.locate(&task.id)?.is_some() {
            return Err(anyhow!("task '{}' already exists", task.id));
        }
        write_json_atomic(&self.path_for(&task.id, task.status), task)
    }

    #[instrument(skip_all, fields(id = %task.id, status = %task.status))]
    fn update(&self, task: &Task) -> Result<()> {
        let mut copies = self.copies(&task.id)?;
        let (current, _) = copies
            .pop()
            .with_context(|| format!("task '{}' not found", task.id))?;
        write_json_atomic(&current, task)?;
        let new_path = self.path_for(&task.id, task.status);
        if current != new_path {
            fs::rename(&current, &new_path).with_context(|| {
                format!("move {} to {}", current.display(), new_path.display())
            })?;
            debug!(from = %current.display(), to = %new_path.display(), "task moved");
        }
        for (stale, _) in copies {
            if stale == new_path {
                continue;
            }
            warn!(path = %stale.display(), "removing stale duplicate task record");
            fs::remove_file(&stale)
                .with_context(|| format!("remove stale task {}", stale.display()))?;
        }
        Ok(())
    }

    fn move_to(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let (path, current) = self
            .locate(id)?
            .with_context(|| format!("task '{id}' not found"))?;
        let mut task = self.load(&path, current)?;
        task.status = status;
        self.update(&task)?;
        Ok(task)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        match self.locate(id)? {
            Some((path, _)) => {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn ensure_safe_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(anyhow!("invalid task id '{id}'"))
    }
}
