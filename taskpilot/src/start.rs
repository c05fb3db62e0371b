//! `taskpilot start`: wire configuration, stores, agent and git into a
//! scheduler and run it under the liveness lease.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::retry::RetryPolicy;
use crate::engine::{EngineSettings, PhaseEngine};
use crate::io::agent::{AgentRunner, CliAgent, requested_engine, select_engine};
use crate::io::artifacts::ArtifactStore;
use crate::io::config::{TaskpilotConfig, load_config};
use crate::io::context::ProjectContext;
use crate::io::git::Git;
use crate::io::history::HistoryStore;
use crate::io::init::EnginePaths;
use crate::io::lease::Lease;
use crate::io::prompt::PromptBuilder;
use crate::io::task_store::FileTaskStore;
use crate::io::watch::TaskWatcher;
use crate::scheduler::{LoopOptions, LoopSummary, Scheduler};
use crate::supervisor::Supervisor;
use crate::vcs::VcsLifecycle;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub root: PathBuf,
    /// `--engine`; falls back to `TASKPILOT_ENGINE`, then configuration.
    pub engine: Option<String>,
    pub interactive: bool,
    pub loop_options: LoopOptions,
}

/// Load and validate `.taskpilot/config.toml`, requiring `init` first.
pub fn load_project_config(paths: &EnginePaths) -> Result<TaskpilotConfig> {
    if !paths.config_path.is_file() {
        return Err(anyhow!(
            "{} is not initialized (run `taskpilot init`)",
            paths.root.display()
        ));
    }
    load_config(&paths.config_path)
}

/// Assemble a scheduler for `paths` around `agent`.
pub fn build_scheduler<A: AgentRunner>(
    paths: &EnginePaths,
    cfg: &TaskpilotConfig,
    agent: A,
    supervisor: Supervisor,
) -> Result<Scheduler<FileTaskStore, A>> {
    build_scheduler_with(paths, cfg, EngineSettings::from_config(cfg), agent, supervisor)
}

/// [`build_scheduler`] with explicit engine settings.
pub fn build_scheduler_with<A: AgentRunner>(
    paths: &EnginePaths,
    cfg: &TaskpilotConfig,
    settings: EngineSettings,
    agent: A,
    supervisor: Supervisor,
) -> Result<Scheduler<FileTaskStore, A>> {
    let store = FileTaskStore::open(paths.tasks_dir(cfg))?;
    let artifacts = ArtifactStore::new(&paths.artifacts_dir);
    let engine = PhaseEngine::new(
        agent,
        PromptBuilder::new(cfg.prompt_budget_bytes)?,
        artifacts.clone(),
        ProjectContext::new(&paths.context_path),
        settings,
    );
    let vcs = VcsLifecycle::new(
        Git::new(&paths.root, cfg.git_timeout()),
        cfg.base_branch.clone(),
        cfg.vcs.clone(),
    );
    let history = HistoryStore::new(&paths.history_dir, cfg.history_limit, artifacts);
    let retry = RetryPolicy {
        max_retries: cfg.max_retries,
        delay: cfg.retry_delay(),
    };
    Ok(Scheduler::new(
        store,
        engine,
        vcs,
        history,
        retry,
        cfg.poll_interval(),
        supervisor,
    ))
}

/// Run the scheduler until it stops.
#[instrument(skip_all, fields(root = %options.root.display()))]
pub async fn start(options: &StartOptions) -> Result<LoopSummary> {
    let paths = EnginePaths::new(&options.root);
    let cfg = load_project_config(&paths)?;
    let requested = requested_engine(options.engine.clone());
    let engine = select_engine(&cfg.agent, requested.as_deref())?;
    info!(engine = %engine.name, interactive = options.interactive, "agent engine selected");

    let lease = Lease::acquire(&paths.pid_path)?;
    let supervisor = Supervisor::new();
    let signals = supervisor.install_signal_handlers();

    let agent = CliAgent::new(
        engine,
        &paths.root,
        cfg.timeouts.kill_grace(),
        cfg.output_limit_bytes,
    )
    .with_echo(cfg.echo_agent_output);
    let settings = EngineSettings {
        interactive: options.interactive,
        ..EngineSettings::from_config(&cfg)
    };
    let scheduler = build_scheduler_with(&paths, &cfg, settings, agent, supervisor)?;
    let watcher = if cfg.watch_tasks {
        start_watcher(scheduler.store().root())
    } else {
        None
    };

    let summary = scheduler
        .run_loop(&options.loop_options, watcher.as_ref())
        .await;
    signals.abort();
    drop(lease);
    summary
}

fn start_watcher(dir: &Path) -> Option<TaskWatcher> {
    match TaskWatcher::start(dir, WATCH_POLL_INTERVAL) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "task watcher unavailable, polling only");
            None
        }
    }
}
