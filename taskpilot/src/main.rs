//! taskpilot CLI.
//!
//! Runs coding agents over a task board: `init` scaffolds `.taskpilot/`,
//! `start` runs the scheduler, `stop` signals it and `status` reports it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskpilot::errors::{AlreadyRunningError, NoEngineError};
use taskpilot::exit_codes;
use taskpilot::io::init::{InitOptions, init_project};
use taskpilot::scheduler::LoopOptions;
use taskpilot::start::{StartOptions, start};

#[derive(Parser)]
#[command(
    name = "taskpilot",
    version,
    about = "Autonomous task execution engine for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskpilot/` with default config and task directories.
    Init {
        /// Project root (defaults to the current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Overwrite engine-owned files if `.taskpilot/` exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the scheduler loop.
    Start {
        #[arg(long)]
        project: Option<PathBuf>,
        /// Agent engine name (overrides TASKPILOT_ENGINE and config).
        #[arg(long)]
        engine: Option<String>,
        /// Run a single scheduling cycle.
        #[arg(long)]
        once: bool,
        /// Report what would run without starting an agent.
        #[arg(long)]
        dry_run: bool,
        /// Attach the agent to this terminal.
        #[arg(long)]
        interactive: bool,
        /// Stop after processing this many tasks.
        #[arg(long)]
        max_tasks: Option<u32>,
    },
    /// Ask the running scheduler to stop.
    Stop {
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Show scheduler liveness and task counts.
    Status {
        #[arg(long)]
        project: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    taskpilot::logging::init();
    let code = match run().await {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<NoEngineError>().is_some() {
        exit_codes::NO_ENGINE
    } else if err.downcast_ref::<AlreadyRunningError>().is_some() {
        exit_codes::ALREADY_RUNNING
    } else {
        exit_codes::INVALID
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { project, force } => {
            let root = project_root(project)?;
            let paths = init_project(&root, &InitOptions { force })?;
            println!("initialized {}", paths.state_dir.display());
            Ok(())
        }
        Command::Start {
            project,
            engine,
            once,
            dry_run,
            interactive,
            max_tasks,
        } => {
            let options = StartOptions {
                root: project_root(project)?,
                engine,
                interactive,
                loop_options: LoopOptions {
                    once,
                    max_tasks,
                    dry_run,
                },
            };
            let summary = start(&options).await?;
            println!(
                "processed {} task(s) in {} cycle(s){}",
                summary.processed,
                summary.cycles,
                if summary.stopped { ", stopped" } else { "" }
            );
            Ok(())
        }
        Command::Stop { project } => {
            match taskpilot::control::stop(&project_root(project)?)? {
                Some(pid) => println!("stop requested (pid {pid})"),
                None => println!("no scheduler running"),
            }
            Ok(())
        }
        Command::Status { project } => {
            print!("{}", taskpilot::control::status(&project_root(project)?)?);
            Ok(())
        }
    }
}

fn project_root(project: Option<PathBuf>) -> Result<PathBuf> {
    match project {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("resolve current directory"),
    }
}
