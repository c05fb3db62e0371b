//! CLI tests for `taskpilot` commands.
//!
//! Spawns the binary and verifies exit codes for init, status, stop and the
//! start preconditions (engine availability, single scheduler).

use std::fs;
use std::process::{Command, Output};

use taskpilot::exit_codes;
use taskpilot::io::config::{EngineConfig, TaskpilotConfig, load_config, write_config};
use taskpilot::io::init::{EnginePaths, InitOptions, init_project};

fn taskpilot(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_taskpilot"))
        .current_dir(dir)
        .args(args)
        .env_remove("TASKPILOT_ENGINE")
        .env_remove("TASKPILOT_TASKS_DIR")
        .output()
        .expect("spawn taskpilot")
}

fn with_engine(paths: &EnginePaths, program: &str) {
    let mut cfg: TaskpilotConfig = load_config(&paths.config_path).expect("config");
    cfg.agent.engines = vec![EngineConfig {
        name: "local".to_string(),
        command: vec![program.to_string()],
        interactive_command: Vec::new(),
    }];
    write_config(&paths.config_path, &cfg).expect("write config");
}

#[test]
fn init_creates_layout_and_refuses_to_repeat() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = taskpilot(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let paths = EnginePaths::new(temp.path());
    assert!(paths.config_path.is_file());
    assert!(temp.path().join(".taskpilot/tasks/todo").is_dir());

    let second = taskpilot(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = taskpilot(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn status_and_stop_without_scheduler() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_project(temp.path(), &InitOptions::default()).expect("init");

    let status = taskpilot(temp.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).contains("scheduler: stopped"));

    let stop = taskpilot(temp.path(), &["stop"]);
    assert_eq!(stop.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&stop.stdout).contains("no scheduler running"));
}

#[test]
fn start_without_init_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = taskpilot(temp.path(), &["start", "--once"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn start_without_installed_engine_exits_no_engine() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
    with_engine(&paths, "taskpilot-missing-agent-binary");

    let out = taskpilot(temp.path(), &["start", "--once"]);
    assert_eq!(out.status.code(), Some(exit_codes::NO_ENGINE));

    let requested = taskpilot(temp.path(), &["start", "--once", "--engine", "nope"]);
    assert_eq!(requested.status.code(), Some(exit_codes::NO_ENGINE));
}

#[cfg(unix)]
#[test]
fn start_refuses_when_another_scheduler_is_alive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
    with_engine(&paths, "sh");
    // This test process is alive and is not the spawned scheduler.
    fs::write(&paths.pid_path, format!("{}\n", std::process::id())).expect("pid marker");

    let out = taskpilot(temp.path(), &["start", "--once", "--dry-run"]);
    assert_eq!(out.status.code(), Some(exit_codes::ALREADY_RUNNING));
    assert!(paths.pid_path.exists(), "foreign marker must be left alone");
}
