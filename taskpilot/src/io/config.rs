//! Engine configuration stored under `.taskpilot/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Phase;

/// Engine configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskpilotConfig {
    /// One-paragraph description of the project, included in every prompt.
    pub project_description: String,

    /// Branch task branches start from and merge into.
    pub base_branch: String,

    /// Task records directory, relative to the project root.
    /// `TASKPILOT_TASKS_DIR` overrides it.
    pub tasks_dir: String,

    /// Maximum CODE/REVIEW/TEST cycles per run.
    pub max_iterations: u32,

    /// Failed runs after which a task stays in `review`.
    pub max_retries: u32,

    /// Minimum time a failed task waits in `review` before the retry sweep.
    pub retry_delay_secs: u64,

    pub poll_interval_secs: u64,

    /// Records kept per task in the history store.
    pub history_limit: usize,

    /// Trailing lines of agent output searched for the outcome marker.
    pub marker_window_lines: usize,

    /// Agent output kept in memory per phase; older bytes are discarded.
    pub output_limit_bytes: usize,

    /// Write the full agent output next to each phase artifact.
    pub save_full_output: bool,

    /// Stream agent output to the console while it runs.
    pub echo_agent_output: bool,

    pub git_timeout_secs: u64,

    /// Upper bound on rendered prompt size; droppable sections go first.
    pub prompt_budget_bytes: usize,

    /// Wake the scheduler early when task files change.
    pub watch_tasks: bool,

    pub timeouts: TimeoutConfig,
    pub vcs: VcsConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub plan_secs: u64,
    pub code_secs: u64,
    pub review_secs: u64,
    pub test_secs: u64,
    pub scope_secs: u64,
    /// Maximum silence from the agent before it is terminated.
    pub inactivity_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Wall-clock limit for one `--interactive` operator session.
    pub session_secs: u64,
}

impl TimeoutConfig {
    pub fn total(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Plan => self.plan_secs,
            Phase::Code => self.code_secs,
            Phase::Review => self.review_secs,
            Phase::Test => self.test_secs,
            Phase::Scope => self.scope_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            plan_secs: 10 * 60,
            code_secs: 30 * 60,
            review_secs: 10 * 60,
            test_secs: 15 * 60,
            scope_secs: 10 * 60,
            inactivity_secs: 5 * 60,
            kill_grace_secs: 10,
            session_secs: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VcsConfig {
    /// Push the task branch to `remote` after commit.
    pub push: bool,
    /// Merge the task branch into the base branch with `--no-ff`.
    pub merge: bool,
    pub remote: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            push: false,
            merge: true,
            remote: "origin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Engine name to use when neither `--engine` nor `TASKPILOT_ENGINE` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,
    /// Known engines, in discovery order.
    pub engines: Vec<EngineConfig>,
}

/// A coding-agent CLI. The prompt is written to its stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub interactive_command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            preferred: None,
            engines: vec![
                EngineConfig {
                    name: "claude".to_string(),
                    command: vec![
                        "claude".to_string(),
                        "-p".to_string(),
                        "--dangerously-skip-permissions".to_string(),
                    ],
                    interactive_command: vec!["claude".to_string()],
                },
                EngineConfig {
                    name: "codex".to_string(),
                    command: vec![
                        "codex".to_string(),
                        "exec".to_string(),
                        "--full-auto".to_string(),
                        "-".to_string(),
                    ],
                    interactive_command: vec!["codex".to_string()],
                },
            ],
        }
    }
}

impl Default for TaskpilotConfig {
    fn default() -> Self {
        Self {
            project_description: String::new(),
            base_branch: "main".to_string(),
            tasks_dir: ".taskpilot/tasks".to_string(),
            max_iterations: 3,
            max_retries: 2,
            retry_delay_secs: 5 * 60,
            poll_interval_secs: 10,
            history_limit: 20,
            marker_window_lines: 40,
            output_limit_bytes: 200_000,
            save_full_output: true,
            echo_agent_output: true,
            git_timeout_secs: 120,
            prompt_budget_bytes: 60_000,
            watch_tasks: true,
            timeouts: TimeoutConfig::default(),
            vcs: VcsConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl TaskpilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must be non-empty"));
        }
        if self.tasks_dir.trim().is_empty() {
            return Err(anyhow!("tasks_dir must be non-empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be > 0"));
        }
        if self.marker_window_lines == 0 {
            return Err(anyhow!("marker_window_lines must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        for phase in Phase::ALL {
            if self.timeouts.total(phase).is_zero() {
                return Err(anyhow!("timeouts.{}_secs must be > 0", phase.as_str()));
            }
        }
        if self.timeouts.inactivity_secs == 0 {
            return Err(anyhow!("timeouts.inactivity_secs must be > 0"));
        }
        if self.timeouts.session_secs == 0 {
            return Err(anyhow!("timeouts.session_secs must be > 0"));
        }
        if self.vcs.push && self.vcs.remote.trim().is_empty() {
            return Err(anyhow!("vcs.remote must be non-empty when vcs.push is set"));
        }
        for engine in &self.agent.engines {
            if engine.name.trim().is_empty() {
                return Err(anyhow!("agent.engines entries need a name"));
            }
            if engine.command.is_empty() || engine.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "agent.engines.{}.command must be a non-empty array",
                    engine.name
                ));
            }
        }
        if let Some(preferred) = &self.agent.preferred
            && !self.agent.engines.iter().any(|e| &e.name == preferred)
        {
            return Err(anyhow!("agent.preferred '{preferred}' is not a configured engine"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retry_delay_secs).unwrap_or(i64::MAX))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TaskpilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<TaskpilotConfig> {
    if !path.exists() {
        let cfg = TaskpilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TaskpilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TaskpilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fsutil::write_atomic(path, buf.as_bytes())
}
