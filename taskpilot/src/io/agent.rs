//! Agent abstraction and the CLI-backed implementation.
//!
//! The [`AgentRunner`] trait decouples the phase engine from the coding-agent
//! backend. Tests use scripted agents that return predetermined output
//! without spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use super::config::{AgentConfig, EngineConfig};
use super::process::{SupervisedCommand, Termination, run_inherited, run_supervised};
use crate::core::types::Phase;
use crate::errors::NoEngineError;
use crate::supervisor::Supervisor;

/// Environment variable naming the preferred engine.
pub const ENGINE_ENV: &str = "TASKPILOT_ENGINE";

/// One phase invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub phase: Phase,
    pub iteration: Option<u32>,
    pub prompt: String,
    pub total_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Where to keep the full output, when enabled.
    pub log_path: Option<PathBuf>,
    /// Hand the terminal to the agent for a live operator session.
    pub interactive: bool,
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub termination: Termination,
    /// Tail of the agent's combined output.
    pub output: String,
    pub duration: Duration,
}

/// Abstraction over coding-agent backends.
#[allow(async_fn_in_trait)]
pub trait AgentRunner {
    fn name(&self) -> &str;

    /// Run one phase. Timeouts and cancellation are reported through
    /// [`AgentResponse::termination`], not as errors.
    async fn run(&self, request: &AgentRequest, supervisor: &Supervisor) -> Result<AgentResponse>;
}

/// Agent driven through its command-line interface.
#[derive(Debug, Clone)]
pub struct CliAgent {
    engine: EngineConfig,
    workdir: PathBuf,
    kill_grace: Duration,
    output_limit_bytes: usize,
    echo: bool,
}

impl CliAgent {
    pub fn new(
        engine: EngineConfig,
        workdir: impl Into<PathBuf>,
        kill_grace: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            engine,
            workdir: workdir.into(),
            kill_grace,
            output_limit_bytes,
            echo: true,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

impl AgentRunner for CliAgent {
    fn name(&self) -> &str {
        &self.engine.name
    }

    #[instrument(skip_all, fields(engine = %self.engine.name, phase = %request.phase, iteration = ?request.iteration))]
    async fn run(&self, request: &AgentRequest, supervisor: &Supervisor) -> Result<AgentResponse> {
        if request.interactive {
            let command = if self.engine.interactive_command.is_empty() {
                &self.engine.command
            } else {
                &self.engine.interactive_command
            };
            let (program, rest) = split_command(command);
            let mut args = rest.to_vec();
            args.push(request.prompt.clone());
            info!("starting interactive agent");
            let (termination, duration) = run_inherited(
                program,
                &args,
                &self.workdir,
                request.total_timeout,
                self.kill_grace,
                supervisor,
            )
            .await?;
            return Ok(AgentResponse {
                termination,
                output: String::new(),
                duration,
            });
        }

        let (program, args) = split_command(&self.engine.command);
        let spec = SupervisedCommand {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: self.workdir.clone(),
            stdin: Some(request.prompt.clone()),
            total_timeout: request.total_timeout,
            inactivity_timeout: request.inactivity_timeout,
            kill_grace: self.kill_grace,
            output_limit_bytes: self.output_limit_bytes,
            echo: self.echo,
            log_path: request.log_path.clone(),
        };
        let out = run_supervised(&spec, supervisor).await?;
        Ok(AgentResponse {
            termination: out.termination,
            output: out.output,
            duration: out.duration,
        })
    }
}

fn split_command(command: &[String]) -> (&str, &[String]) {
    match command.split_first() {
        Some((program, args)) => (program.as_str(), args),
        None => ("", &[]),
    }
}

/// Pick the engine to run.
///
/// `requested` (CLI flag, else `TASKPILOT_ENGINE`) must name an installed
/// engine. Otherwise the configured preference is used when installed, then
/// the first installed engine in configuration order.
pub fn select_engine(cfg: &AgentConfig, requested: Option<&str>) -> Result<EngineConfig> {
    select_engine_with(cfg, requested, is_installed)
}

fn select_engine_with(
    cfg: &AgentConfig,
    requested: Option<&str>,
    installed: impl Fn(&EngineConfig) -> bool,
) -> Result<EngineConfig> {
    let tried: Vec<String> = cfg.engines.iter().map(|e| e.name.clone()).collect();

    if let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) {
        return match cfg.engines.iter().find(|e| e.name == name) {
            Some(engine) if installed(engine) => {
                debug!(engine = name, "using requested engine");
                Ok(engine.clone())
            }
            _ => Err(NoEngineError {
                requested: Some(name.to_string()),
                tried,
            }
            .into()),
        };
    }

    if let Some(name) = &cfg.preferred {
        match cfg.engines.iter().find(|e| &e.name == name) {
            Some(engine) if installed(engine) => return Ok(engine.clone()),
            _ => warn!(engine = %name, "preferred engine not installed, discovering"),
        }
    }

    cfg.engines
        .iter()
        .find(|e| installed(e))
        .cloned()
        .ok_or_else(|| {
            NoEngineError {
                requested: None,
                tried,
            }
            .into()
        })
}

fn is_installed(engine: &EngineConfig) -> bool {
    engine
        .command
        .first()
        .is_some_and(|program| which::which(program).is_ok())
}

/// `--engine` if given, else `TASKPILOT_ENGINE`.
pub fn requested_engine(flag: Option<String>) -> Option<String> {
    flag.or_else(|| std::env::var(ENGINE_ENV).ok())
        .filter(|v| !v.trim().is_empty())
}
