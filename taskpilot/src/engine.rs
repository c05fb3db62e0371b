//! Phase engine: one task through PLAN, CODE/REVIEW/TEST iterations and SCOPE.
//!
//! The engine never touches git or the task store. It drives the agent,
//! classifies each phase, writes per-phase artifacts and returns a
//! [`TaskReport`] the scheduler turns into task and history updates.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::marker::{NOTES_TAG, classify, find_marker, tail_lines};
use crate::core::record::{ExecutionRecord, PhaseEntry, PhaseLog};
use crate::core::types::{Phase, PhaseStatus, RunResult, Task};
use crate::errors::CancelledError;
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::artifacts::ArtifactStore;
use crate::io::config::{TaskpilotConfig, TimeoutConfig};
use crate::io::context::ProjectContext;
use crate::io::process::Termination;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::supervisor::Supervisor;

const SUMMARY_LIMIT: usize = 500;
const TIMEOUT_TAIL_LINES: usize = 10;

/// Engine knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub project_description: String,
    pub max_iterations: u32,
    pub marker_window_lines: usize,
    pub save_full_output: bool,
    pub timeouts: TimeoutConfig,
    /// Replace the phase protocol with one live operator session per task.
    pub interactive: bool,
}

impl EngineSettings {
    pub fn from_config(cfg: &TaskpilotConfig) -> Self {
        Self {
            project_description: cfg.project_description.clone(),
            max_iterations: cfg.max_iterations.max(1),
            marker_window_lines: cfg.marker_window_lines,
            save_full_output: cfg.save_full_output,
            timeouts: cfg.timeouts.clone(),
            interactive: false,
        }
    }
}

/// Outcome of one task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub result: RunResult,
    /// CODE iterations started.
    pub iterations: u32,
    pub phases: PhaseLog,
    pub summary: String,
    pub error: Option<String>,
    pub error_phase: Option<Phase>,
    pub duration: Duration,
}

impl TaskReport {
    pub fn into_record(self, timestamp: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            timestamp,
            result: self.result,
            total_duration_ms: duration_ms(self.duration),
            iterations: self.iterations,
            summary: self.summary,
            error: self.error,
            error_phase: self.error_phase,
            phases: self.phases,
            reconstructed: false,
        }
    }
}

/// One classified phase attempt.
#[derive(Debug, Clone)]
struct PhaseRun {
    entry: PhaseEntry,
    detail: String,
    output: String,
}

impl PhaseRun {
    fn status(&self) -> PhaseStatus {
        self.entry.status
    }
}

/// Last failed attempt inside the iteration block.
#[derive(Debug, Clone)]
struct Failure {
    phase: Phase,
    status: PhaseStatus,
    detail: String,
}

pub struct PhaseEngine<A> {
    agent: A,
    prompts: PromptBuilder,
    artifacts: ArtifactStore,
    context: ProjectContext,
    settings: EngineSettings,
}

impl<A: AgentRunner> PhaseEngine<A> {
    pub fn new(
        agent: A,
        prompts: PromptBuilder,
        artifacts: ArtifactStore,
        context: ProjectContext,
        settings: EngineSettings,
    ) -> Self {
        Self {
            agent,
            prompts,
            artifacts,
            context,
            settings,
        }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Run `task` the way the engine is configured to: the phase protocol, or
    /// a single operator session in interactive mode.
    pub async fn run_task(&self, task: &Task, supervisor: &Supervisor) -> Result<TaskReport> {
        if self.settings.interactive {
            self.run_session(task, supervisor).await
        } else {
            self.run(task, supervisor).await
        }
    }

    /// One live operator session. Its exit status alone decides the result:
    /// exit 0 keeps the work, anything else discards it.
    #[instrument(skip_all, fields(task_id = %task.id, engine = %self.agent.name()))]
    pub async fn run_session(&self, task: &Task, supervisor: &Supervisor) -> Result<TaskReport> {
        let started = Instant::now();
        self.artifacts.reset(&task.id)?;
        let inputs = PromptInputs {
            project_description: self.settings.project_description.clone(),
            project_context: self.context.read()?,
            max_iterations: 1,
            ..PromptInputs::default()
        };
        let limit = self.settings.timeouts.session();
        let request = AgentRequest {
            phase: Phase::Code,
            iteration: Some(1),
            prompt: self.prompts.build_session(task, &inputs)?,
            total_timeout: limit,
            inactivity_timeout: limit,
            log_path: None,
            interactive: true,
        };
        info!("interactive session started");
        let response = self.agent.run(&request, supervisor).await?;

        let (status, detail) = match response.termination {
            Termination::Cancelled => return Err(CancelledError.into()),
            Termination::TotalTimeout | Termination::Inactivity => (
                PhaseStatus::Timeout,
                format!("interactive session timed out after {}s", limit.as_secs()),
            ),
            Termination::Exited(Some(0)) => {
                (PhaseStatus::Ok, "interactive session finished".to_string())
            }
            Termination::Exited(Some(code)) => (
                PhaseStatus::Failed,
                format!("interactive session exited with status {code}"),
            ),
            Termination::Exited(None) => (
                PhaseStatus::Failed,
                "interactive session ended by a signal".to_string(),
            ),
        };

        let mut entry = PhaseEntry::new(Phase::Code, Some(1), status);
        entry.duration_ms = duration_ms(response.duration);
        entry.summary = detail.clone();
        self.artifacts.write(&task.id, &entry, &detail)?;
        info!(status = %status, duration_ms = entry.duration_ms, "interactive session ended");
        let mut phases = PhaseLog::default();
        phases.push(entry);

        Ok(match status {
            PhaseStatus::Ok => TaskReport {
                result: RunResult::Success,
                iterations: 1,
                phases,
                summary: detail,
                error: None,
                error_phase: None,
                duration: started.elapsed(),
            },
            PhaseStatus::Timeout => {
                failed_report(RunResult::Timeout, 1, phases, Phase::Code, detail, started)
            }
            _ => failed_report(RunResult::Failed, 1, phases, Phase::Code, detail, started),
        })
    }

    /// Run the full protocol for `task`.
    ///
    /// Phase failures are part of the report. Errors are reserved for I/O
    /// problems and for cancellation ([`CancelledError`]).
    #[instrument(skip_all, fields(task_id = %task.id, engine = %self.agent.name()))]
    pub async fn run(&self, task: &Task, supervisor: &Supervisor) -> Result<TaskReport> {
        let started = Instant::now();
        self.artifacts.reset(&task.id)?;
        let mut phases = PhaseLog::default();
        let mut inputs = PromptInputs {
            project_description: self.settings.project_description.clone(),
            project_context: self.context.read()?,
            max_iterations: self.settings.max_iterations,
            ..PromptInputs::default()
        };

        let plan = self
            .run_phase(Phase::Plan, None, task, &inputs, supervisor, &mut phases)
            .await?;
        if !plan.status().is_ok() {
            let result = if plan.status() == PhaseStatus::Timeout {
                RunResult::Timeout
            } else {
                RunResult::Failed
            };
            return Ok(failed_report(result, 0, phases, Phase::Plan, plan.detail, started));
        }
        inputs.plan = Some(plan.detail);

        let mut iterations = 0;
        let mut last_failure: Option<Failure> = None;
        for iteration in 1..=self.settings.max_iterations {
            iterations = iteration;
            inputs.iteration = Some(iteration);
            inputs.feedback = last_failure.as_ref().map(feedback_for);

            match self
                .run_iteration(iteration, task, &inputs, supervisor, &mut phases)
                .await?
            {
                None => {
                    last_failure = None;
                    break;
                }
                Some(failure) => {
                    info!(
                        iteration,
                        phase = %failure.phase,
                        status = %failure.status,
                        "iteration failed"
                    );
                    inputs.attempts.push(attempt_line(iteration, &failure));
                    last_failure = Some(failure);
                }
            }
        }

        if let Some(failure) = last_failure {
            let result = exhausted_result(&failure);
            warn!(iterations, ?result, "iterations exhausted");
            return Ok(failed_report(
                result,
                iterations,
                phases,
                failure.phase,
                failure.detail,
                started,
            ));
        }

        inputs.iteration = None;
        inputs.feedback = None;
        let scope = self
            .run_phase(Phase::Scope, None, task, &inputs, supervisor, &mut phases)
            .await?;
        match scope.status() {
            PhaseStatus::Ok => {
                let notes = find_marker(&scope.output, NOTES_TAG, self.settings.marker_window_lines);
                let notes = if notes.found && !notes.value.is_empty() {
                    notes.value
                } else {
                    scope.detail.clone()
                };
                self.context.append(task, &notes, Utc::now())?;
                Ok(TaskReport {
                    result: RunResult::Success,
                    iterations,
                    phases,
                    summary: clip(&format!(
                        "completed in {iterations} iteration(s): {}",
                        first_line(&scope.detail)
                    )),
                    error: None,
                    error_phase: None,
                    duration: started.elapsed(),
                })
            }
            PhaseStatus::Timeout => Ok(failed_report(
                RunResult::Timeout,
                iterations,
                phases,
                Phase::Scope,
                scope.detail,
                started,
            )),
            _ => Ok(failed_report(
                RunResult::ScopeIncomplete,
                iterations,
                phases,
                Phase::Scope,
                scope.detail,
                started,
            )),
        }
    }

    /// CODE, then REVIEW, then TEST. `None` means all three passed.
    async fn run_iteration(
        &self,
        iteration: u32,
        task: &Task,
        inputs: &PromptInputs,
        supervisor: &Supervisor,
        phases: &mut PhaseLog,
    ) -> Result<Option<Failure>> {
        for phase in [Phase::Code, Phase::Review, Phase::Test] {
            let run = self
                .run_phase(phase, Some(iteration), task, inputs, supervisor, phases)
                .await?;
            if !run.status().is_ok() {
                return Ok(Some(Failure {
                    phase,
                    status: run.status(),
                    detail: run.detail,
                }));
            }
        }
        Ok(None)
    }

    #[instrument(skip_all, fields(phase = %phase, iteration = ?iteration))]
    async fn run_phase(
        &self,
        phase: Phase,
        iteration: Option<u32>,
        task: &Task,
        inputs: &PromptInputs,
        supervisor: &Supervisor,
        phases: &mut PhaseLog,
    ) -> Result<PhaseRun> {
        let prompt = self.prompts.build(phase, task, inputs)?;
        let mut entry = PhaseEntry::new(phase, iteration, PhaseStatus::Unknown);
        let request = AgentRequest {
            phase,
            iteration,
            prompt,
            total_timeout: self.settings.timeouts.total(phase),
            inactivity_timeout: self.settings.timeouts.inactivity(),
            log_path: self
                .settings
                .save_full_output
                .then(|| self.artifacts.log_path(&task.id, &entry)),
            interactive: false,
        };
        info!(prompt_bytes = request.prompt.len(), "phase started");
        let response = self.agent.run(&request, supervisor).await?;

        let (status, detail) = match response.termination {
            Termination::Cancelled => return Err(CancelledError.into()),
            Termination::TotalTimeout => (
                PhaseStatus::Timeout,
                timeout_detail(
                    &format!(
                        "timed out after {}s",
                        request.total_timeout.as_secs()
                    ),
                    &response.output,
                ),
            ),
            Termination::Inactivity => (
                PhaseStatus::Timeout,
                timeout_detail(
                    &format!(
                        "no output for {}s",
                        request.inactivity_timeout.as_secs()
                    ),
                    &response.output,
                ),
            ),
            Termination::Exited(code) => {
                let classified = classify(
                    phase,
                    &response.output,
                    code,
                    self.settings.marker_window_lines,
                );
                debug!(via_marker = classified.via_marker, exit_code = ?code, "phase classified");
                (classified.status, classified.detail)
            }
        };

        entry.status = status;
        entry.duration_ms = duration_ms(response.duration);
        entry.summary = clip(&detail);
        self.artifacts.write(&task.id, &entry, &detail)?;
        info!(status = %status, duration_ms = entry.duration_ms, "phase finished");
        phases.push(entry.clone());

        Ok(PhaseRun {
            entry,
            detail,
            output: response.output,
        })
    }
}

fn failed_report(
    result: RunResult,
    iterations: u32,
    phases: PhaseLog,
    phase: Phase,
    detail: String,
    started: Instant,
) -> TaskReport {
    let reason = if detail.trim().is_empty() {
        format!("{phase} phase ended without detail")
    } else {
        detail.trim().to_string()
    };
    TaskReport {
        result,
        iterations,
        phases,
        summary: clip(&format!("{phase}: {}", first_line(&reason))),
        error: Some(clip(&reason)),
        error_phase: Some(phase),
        duration: started.elapsed(),
    }
}

fn exhausted_result(failure: &Failure) -> RunResult {
    if failure.status == PhaseStatus::Timeout {
        return RunResult::Timeout;
    }
    match failure.phase {
        Phase::Review => RunResult::ReviewFailed,
        Phase::Test => RunResult::TestFailed,
        _ => RunResult::Exhausted,
    }
}

fn feedback_for(failure: &Failure) -> String {
    format!(
        "The {} phase of the previous attempt ended {}:\n{}",
        failure.phase, failure.status, failure.detail
    )
}

fn attempt_line(iteration: u32, failure: &Failure) -> String {
    format!(
        "{} {iteration}: {} - {}",
        failure.phase,
        failure.status,
        first_line(&failure.detail)
    )
}

fn timeout_detail(reason: &str, output: &str) -> String {
    let tail = tail_lines(output, TIMEOUT_TAIL_LINES);
    if tail.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}\n{tail}")
    }
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn clip(text: &str) -> String {
    let text = text.trim();
    if text.len() <= SUMMARY_LIMIT {
        return text.to_string();
    }
    let mut cut = SUMMARY_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{ScriptedAgent, ScriptedReply};

    struct Fixture {
        _temp: tempfile::TempDir,
        engine: PhaseEngine<ScriptedAgent>,
        context: ProjectContext,
        artifacts: ArtifactStore,
    }

    fn fixture(replies: Vec<ScriptedReply>, max_iterations: u32) -> Fixture {
        build_fixture(replies, max_iterations, false)
    }

    fn build_fixture(replies: Vec<ScriptedReply>, max_iterations: u32, interactive: bool) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(temp.path().join("artifacts"));
        let context = ProjectContext::new(temp.path().join("context.md"));
        let settings = EngineSettings {
            project_description: "demo".to_string(),
            max_iterations,
            marker_window_lines: 40,
            save_full_output: false,
            timeouts: TimeoutConfig::default(),
            interactive,
        };
        let engine = PhaseEngine::new(
            ScriptedAgent::new(replies),
            PromptBuilder::new(60_000).expect("prompts"),
            artifacts.clone(),
            context.clone(),
            settings,
        );
        Fixture {
            _temp: temp,
            engine,
            context,
            artifacts,
        }
    }

    fn task() -> Task {
        Task::new("t-1", "Add login", TaskStatus::InProgress)
    }

    fn statuses(entries: &[PhaseEntry]) -> Vec<PhaseStatus> {
        entries.iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn happy_path_runs_every_phase_once() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: 1. add route"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: ok"),
                ScriptedReply::marker(
                    Phase::Scope,
                    "CONTEXTO:\nLogin lives in src/auth.rs\nALCANCE: ok",
                ),
            ],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");

        assert_eq!(report.result, RunResult::Success);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.error, None);
        assert_eq!(report.phases.entries().len(), 5);
        assert!(f.context.read().expect("context").contains("Login lives in src/auth.rs"));
        assert_eq!(f.artifacts.index("t-1").expect("index").len(), 5);
        assert_eq!(f.engine.agent().remaining(), 0);
    }

    /// Code fails twice, succeeds on the third attempt; feedback reaches each retry.
    #[tokio::test]
    async fn code_failures_feed_the_next_attempt() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: do it"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: fallido - missing import"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: fallido - type error"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: ok"),
                ScriptedReply::marker(Phase::Scope, "ALCANCE: ok"),
            ],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");

        assert_eq!(report.result, RunResult::Success);
        assert_eq!(report.iterations, 3);
        assert_eq!(
            statuses(&report.phases.code),
            vec![PhaseStatus::Failed, PhaseStatus::Failed, PhaseStatus::Ok]
        );

        let prompts = f.engine.agent().prompts(Phase::Code);
        assert!(prompts[1].contains("missing import"));
        assert!(prompts[2].contains("type error"));
        assert!(prompts[2].contains("code 1: failed - missing import"));
    }

    #[tokio::test]
    async fn review_timeout_on_last_iteration_ends_as_timeout() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: do it"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: rechazado - no tests"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::terminated(Phase::Review, Termination::TotalTimeout),
            ],
            2,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");

        assert_eq!(report.result, RunResult::Timeout);
        assert_eq!(report.error_phase, Some(Phase::Review));
        assert_eq!(
            statuses(&report.phases.review),
            vec![PhaseStatus::Rejected, PhaseStatus::Timeout]
        );
        assert!(report.phases.scope.is_none());
        assert!(report.error.as_deref().is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn repeated_test_failures_exhaust_as_test_failed() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: do it"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: fallido - login_rejects"),
            ],
            1,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::TestFailed);
        assert_eq!(report.error_phase, Some(Phase::Test));
        assert_eq!(report.error.as_deref(), Some("login_rejects"));
    }

    #[tokio::test]
    async fn plan_timeout_is_fatal() {
        let f = fixture(
            vec![ScriptedReply::terminated(Phase::Plan, Termination::Inactivity)],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::Timeout);
        assert_eq!(report.error_phase, Some(Phase::Plan));
        assert_eq!(report.iterations, 0);
        assert!(report.phases.code.is_empty());
    }

    #[tokio::test]
    async fn plan_without_marker_uses_output_tail() {
        let f = fixture(
            vec![
                ScriptedReply::raw(Phase::Plan, "step one\nstep two\n", Some(0)),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: ok"),
                ScriptedReply::marker(Phase::Scope, "ALCANCE: ok"),
            ],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::Success);
        assert!(f.engine.agent().prompts(Phase::Code)[0].contains("step two"));
    }

    #[tokio::test]
    async fn scope_incomplete_keeps_the_missing_note() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: do it"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: ok"),
                ScriptedReply::marker(Phase::Scope, "ALCANCE: incompleto - no logout route"),
            ],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::ScopeIncomplete);
        assert_eq!(report.error.as_deref(), Some("no logout route"));
        assert_eq!(f.context.read().expect("context"), "");
    }

    #[tokio::test]
    async fn inconclusive_scope_is_incomplete() {
        let f = fixture(
            vec![
                ScriptedReply::marker(Phase::Plan, "PLAN: do it"),
                ScriptedReply::marker(Phase::Code, "RESULTADO: completado"),
                ScriptedReply::marker(Phase::Review, "REVISION: aprobado"),
                ScriptedReply::marker(Phase::Test, "PRUEBAS: ok"),
                ScriptedReply::raw(Phase::Scope, "crashed\n", Some(1)),
            ],
            3,
        );
        let report = f.engine.run(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::ScopeIncomplete);
        assert_eq!(
            report.phases.scope.as_ref().map(|e| e.status),
            Some(PhaseStatus::Unknown)
        );
    }

    #[tokio::test]
    async fn cancellation_is_a_typed_error() {
        let f = fixture(
            vec![ScriptedReply::terminated(Phase::Plan, Termination::Cancelled)],
            3,
        );
        let err = f
            .engine
            .run(&task(), &Supervisor::new())
            .await
            .expect_err("cancelled");
        assert!(err.downcast_ref::<CancelledError>().is_some());
    }

    /// Interactive mode is one session: no plan, review, test or scope.
    #[tokio::test]
    async fn interactive_mode_runs_one_session() {
        let f = build_fixture(vec![ScriptedReply::raw(Phase::Code, "", Some(0))], 3, true);
        let report = f.engine.run_task(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::Success);
        assert_eq!(report.iterations, 1);
        assert_eq!(f.engine.agent().phases(), vec![(Phase::Code, Some(1))]);
        assert_eq!(f.engine.agent().remaining(), 0);

        let requests = f.engine.agent().requests();
        assert!(requests[0].interactive);
        assert!(requests[0].prompt.contains("pairing live with an operator"));
        assert!(report.phases.plan.is_none() && report.phases.scope.is_none());
        assert_eq!(f.artifacts.index("t-1").expect("index").len(), 1);
    }

    #[tokio::test]
    async fn failed_interactive_session_fails_the_task() {
        let f = build_fixture(vec![ScriptedReply::raw(Phase::Code, "", Some(130))], 3, true);
        let report = f.engine.run_task(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::Failed);
        assert_eq!(report.error_phase, Some(Phase::Code));
        assert!(report.error.as_deref().is_some_and(|e| e.contains("status 130")));
    }

    #[tokio::test]
    async fn phase_protocol_requests_are_not_interactive() {
        let f = fixture(crate::test_support::passing_run(), 1);
        let report = f.engine.run_task(&task(), &Supervisor::new()).await.expect("run");
        assert_eq!(report.result, RunResult::Success);
        assert!(f.engine.agent().requests().iter().all(|r| !r.interactive));
    }
}
