//! Test-only helpers: a throwaway git repository, a scripted agent and task
//! builders.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::core::marker::protocol;
use crate::core::types::{Phase, Task, TaskStatus};
use crate::io::agent::{AgentRequest, AgentResponse, AgentRunner};
use crate::io::git::Git;
use crate::io::process::Termination;
use crate::supervisor::Supervisor;

/// A git repository in a temp directory with one commit on `main`.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = Self { temp };
        repo.run_git(&["init", "-q"]);
        repo.run_git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.run_git(&["config", "user.email", "tests@example.com"]);
        repo.run_git(&["config", "user.name", "Tests"]);
        repo.run_git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# fixture\n");
        repo.run_git(&["add", "-A"]);
        repo.run_git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path(), Duration::from_secs(30))
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).expect("read file")
    }

    /// Commit subjects reachable from HEAD, newest first.
    pub fn log_subjects(&self) -> Vec<String> {
        self.run_git(&["log", "--format=%s"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn run_git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum Action {
    Respond {
        termination: Termination,
        output: String,
    },
    Fail(String),
    Panic(String),
}

/// One canned agent reply, checked against the phase it was asked for.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    phase: Phase,
    action: Action,
    files: Vec<(String, String)>,
}

impl ScriptedReply {
    /// Exit 0 with `text` as the closing lines.
    pub fn marker(phase: Phase, text: &str) -> Self {
        Self::raw(phase, &format!("working on it\n{text}\n"), Some(0))
    }

    pub fn raw(phase: Phase, output: &str, exit_code: Option<i32>) -> Self {
        Self {
            phase,
            action: Action::Respond {
                termination: Termination::Exited(exit_code),
                output: output.to_string(),
            },
            files: Vec::new(),
        }
    }

    /// The agent was stopped by a timer or by cancellation.
    pub fn terminated(phase: Phase, termination: Termination) -> Self {
        Self {
            phase,
            action: Action::Respond {
                termination,
                output: String::new(),
            },
            files: Vec::new(),
        }
    }

    /// The phase passes with its protocol's success word.
    pub fn pass(phase: Phase) -> Self {
        let proto = protocol(phase);
        let word = if phase == Phase::Plan { "do the work" } else { proto.pass };
        Self::marker(phase, &format!("{} {word}", proto.tag))
    }

    /// The runner itself errors (spawn failure and the like).
    pub fn error(phase: Phase, message: &str) -> Self {
        Self {
            phase,
            action: Action::Fail(message.to_string()),
            files: Vec::new(),
        }
    }

    pub fn panic(phase: Phase, message: &str) -> Self {
        Self {
            phase,
            action: Action::Panic(message.to_string()),
            files: Vec::new(),
        }
    }

    /// Write a file into the agent's working directory while "running".
    pub fn with_file(mut self, rel: &str, contents: &str) -> Self {
        self.files.push((rel.to_string(), contents.to_string()));
        self
    }
}

/// Passing replies for a full single-iteration run.
pub fn passing_run() -> Vec<ScriptedReply> {
    Phase::ALL.into_iter().map(ScriptedReply::pass).collect()
}

/// An [`AgentRunner`] that plays back queued replies in order.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<AgentRequest>>,
    workdir: Option<PathBuf>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            workdir: None,
        }
    }

    /// Directory `with_file` writes land in.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().expect("replies lock").push_back(reply);
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }

    /// Prompts received for `phase`, in order.
    pub fn prompts(&self, phase: Phase) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.phase == phase)
            .map(|r| r.prompt.clone())
            .collect()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Phases requested so far, in order.
    pub fn phases(&self) -> Vec<(Phase, Option<u32>)> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|r| (r.phase, r.iteration))
            .collect()
    }
}

impl AgentRunner for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &AgentRequest, _supervisor: &Supervisor) -> Result<AgentResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no reply for {}", request.phase))?;
        if reply.phase != request.phase {
            bail!(
                "scripted reply is for {} but the agent was asked for {}",
                reply.phase,
                request.phase
            );
        }
        if let Some(dir) = &self.workdir {
            for (rel, contents) in &reply.files {
                let path = dir.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, contents)?;
            }
        }
        match reply.action {
            Action::Respond {
                termination,
                output,
            } => Ok(AgentResponse {
                termination,
                output,
                duration: Duration::from_millis(5),
            }),
            Action::Fail(message) => Err(anyhow!(message)),
            Action::Panic(message) => panic!("{message}"),
        }
    }
}

/// A task with a fixed creation time `minute` minutes into 2026.
pub fn task(id: &str, status: TaskStatus, minute: i64) -> Task {
    let mut task = Task::new(id, format!("{id} title"), status);
    task.created_at = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("base time")
        + chrono::Duration::minutes(minute);
    task.description = format!("Implement {id}.");
    task
}

/// A `todo` task depending on `deps`.
pub fn task_with_deps(id: &str, minute: i64, deps: &[&str]) -> Task {
    let mut task = task(id, TaskStatus::Todo, minute);
    task.depends_on = deps.iter().map(|d| d.to_string()).collect();
    task
}
