//! Shared deterministic types for the execution engine.
//!
//! These types are the stable contracts between the scheduler, the phase
//! engine and the stores. They serialize with the field names the board reads.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Board column a task lives in. The order is the board's left-to-right order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Backlog,
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Feature,
    Fix,
    Bug,
    Architecture,
}

impl TaskType {
    /// Conventional-commit prefix used for the task's commit.
    pub fn commit_prefix(&self) -> &'static str {
        match self {
            TaskType::Feature => "feat",
            TaskType::Fix | TaskType::Bug => "fix",
            TaskType::Architecture => "refactor",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Feature => "feature",
            TaskType::Fix => "fix",
            TaskType::Bug => "bug",
            TaskType::Architecture => "architecture",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// One step of the per-task protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Code,
    Review,
    Test,
    Scope,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Plan,
        Phase::Code,
        Phase::Review,
        Phase::Test,
        Phase::Scope,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Code => "code",
            Phase::Review => "review",
            Phase::Test => "test",
            Phase::Scope => "scope",
        }
    }

    /// Code, review and test repeat once per iteration; plan and scope run once.
    pub fn is_iterated(&self) -> bool {
        matches!(self, Phase::Code | Phase::Review | Phase::Test)
    }

    pub fn parse(value: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|phase| phase.as_str() == value)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded status of a single phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Ok,
    Failed,
    Rejected,
    Timeout,
    Lost,
    Unknown,
}

impl PhaseStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PhaseStatus::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Ok => "ok",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Rejected => "rejected",
            PhaseStatus::Timeout => "timeout",
            PhaseStatus::Lost => "lost",
            PhaseStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunResult {
    Success,
    Failed,
    ReviewFailed,
    TestFailed,
    Timeout,
    ScopeIncomplete,
    Exhausted,
}

impl RunResult {
    /// Whether the task's work is kept (committed) for this result.
    pub fn keeps_work(&self) -> bool {
        matches!(self, RunResult::Success | RunResult::ScopeIncomplete)
    }

    /// Column the task lands in after a run with this result.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            RunResult::Success => TaskStatus::Done,
            _ => TaskStatus::Review,
        }
    }
}

/// A unit of work as stored by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_phase: Option<Phase>,
    #[serde(default)]
    pub iterations: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind: TaskType::default(),
            priority: Priority::default(),
            branch: None,
            labels: BTreeSet::new(),
            depends_on: Vec::new(),
            status,
            description: String::new(),
            acceptance: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_attempt_at: None,
            retried_at: None,
            retry_count: 0,
            last_error: None,
            last_error_phase: None,
            iterations: 0,
        }
    }

    /// Branch the task's work happens on.
    pub fn branch_name(&self) -> String {
        match self.branch.as_deref().map(str::trim) {
            Some(branch) if !branch.is_empty() => branch.to_string(),
            _ => format!("task/{}", self.id),
        }
    }
}
