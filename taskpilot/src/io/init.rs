//! Canonical paths and scaffolding for `.taskpilot/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use super::config::{TaskpilotConfig, write_config};
use crate::core::types::TaskStatus;

/// Environment variable overriding the task records directory.
pub const TASKS_DIR_ENV: &str = "TASKPILOT_TASKS_DIR";

/// All canonical paths within `.taskpilot/` for a project root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub context_path: PathBuf,
    pub history_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub pid_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".taskpilot");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            context_path: state_dir.join("context.md"),
            history_dir: state_dir.join("history"),
            artifacts_dir: state_dir.join("artifacts"),
            pid_path: state_dir.join("scheduler.pid"),
        }
    }

    /// Task records directory: `TASKPILOT_TASKS_DIR` if set, else `cfg.tasks_dir`.
    /// Relative paths resolve against the project root.
    pub fn tasks_dir(&self, cfg: &TaskpilotConfig) -> PathBuf {
        let configured = std::env::var(TASKS_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| cfg.tasks_dir.clone());
        let path = PathBuf::from(configured);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.taskpilot/` scaffolding in `root`.
///
/// Fails if `.taskpilot/` already exists unless `options.force` is set.
/// Task records and the project context are never overwritten.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .taskpilot exists but is not a directory"));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .taskpilot already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.history_dir)?;
    create_dir(&paths.artifacts_dir)?;
    // Everything under .taskpilot/ is local state and must never dirty the worktree.
    write_file(&paths.gitignore_path, "*\n")?;
    write_config(&paths.config_path, &TaskpilotConfig::default())?;
    if !paths.context_path.exists() {
        write_file(&paths.context_path, CONTEXT_PLACEHOLDER)?;
    }

    let tasks_dir = paths.tasks_dir(&TaskpilotConfig::default());
    for status in TaskStatus::ALL {
        create_dir(&tasks_dir.join(status.as_str()))?;
    }

    info!(root = %root.display(), tasks_dir = %tasks_dir.display(), "initialized .taskpilot");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    debug!(path = %path.display(), "create dir");
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const CONTEXT_PLACEHOLDER: &str = "# Project context\n\n\
Knowledge accumulated by completed tasks. Edit freely; every phase prompt includes it.\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_scaffolding() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions::default()).expect("init");

        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            "*\n"
        );
        assert!(paths.config_path.exists());
        assert!(paths.context_path.exists());
        assert!(paths.history_dir.is_dir());
        assert!(paths.artifacts_dir.is_dir());
        assert!(temp.path().join(".taskpilot/tasks/todo").is_dir());
        assert!(temp.path().join(".taskpilot/tasks/in_progress").is_dir());
    }

    #[test]
    fn init_refuses_existing_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions::default()).expect("init");
        let err = init_project(temp.path(), &InitOptions::default()).expect_err("second init");
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn force_keeps_project_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
        fs::write(&paths.context_path, "learned things\n").expect("write context");

        init_project(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.context_path).expect("context"),
            "learned things\n"
        );
    }
}
