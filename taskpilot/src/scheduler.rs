//! Scheduler loop: heal, sweep retries, pick one eligible task, run it.
//!
//! Exactly one task is processed at a time. Everything that can go wrong
//! while processing a task (agent errors, git failures, panics) ends with the
//! task in `review` and the loop still running; only a stop request ends a
//! run early. Git steps are blocking subprocess calls and run on tokio's
//! blocking pool.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::core::deps::{Eligibility, select_candidate};
use crate::core::record::PhaseLog;
use crate::core::retry::{RetryPolicy, mark_retried};
use crate::core::types::{RunResult, Task, TaskStatus};
use crate::engine::{PhaseEngine, TaskReport};
use crate::errors::CancelledError;
use crate::io::agent::AgentRunner;
use crate::io::history::HistoryStore;
use crate::io::task_store::TaskStore;
use crate::io::watch::TaskWatcher;
use crate::supervisor::Supervisor;
use crate::vcs::{TaskCheckout, VcsLifecycle};

/// How long `run_loop` keeps going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOptions {
    /// Run a single cycle.
    pub once: bool,
    /// Stop after this many processed tasks.
    pub max_tasks: Option<u32>,
    /// Select but never run or mutate the selected task.
    pub dry_run: bool,
}

/// A task the scheduler ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTask {
    pub task_id: String,
    pub result: RunResult,
    pub status: TaskStatus,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another task is `in_progress`.
    Busy { task_id: String },
    /// Nothing eligible.
    Idle { skipped: Vec<(String, Eligibility)> },
    /// Dry run: this task would have run.
    DryRun {
        task_id: String,
        skipped: Vec<(String, Eligibility)>,
    },
    Processed(ProcessedTask),
    /// A stop request interrupted the task, which went back to `todo`.
    Stopped { task_id: String },
}

/// Totals for one `run_loop` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: u32,
    pub processed: u32,
    pub stopped: bool,
}

pub struct Scheduler<S, A> {
    store: S,
    engine: PhaseEngine<A>,
    vcs: VcsLifecycle,
    history: HistoryStore,
    retry: RetryPolicy,
    poll_interval: Duration,
    supervisor: Supervisor,
}

impl<S: TaskStore, A: AgentRunner> Scheduler<S, A> {
    pub fn new(
        store: S,
        engine: PhaseEngine<A>,
        vcs: VcsLifecycle,
        history: HistoryStore,
        retry: RetryPolicy,
        poll_interval: Duration,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            store,
            engine,
            vcs,
            history,
            retry,
            poll_interval,
            supervisor,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &PhaseEngine<A> {
        &self.engine
    }

    /// Cycle until stopped, the task cap is hit, or after one cycle with `once`.
    #[instrument(skip_all, fields(once = options.once, dry_run = options.dry_run))]
    pub async fn run_loop(
        &self,
        options: &LoopOptions,
        watcher: Option<&TaskWatcher>,
    ) -> Result<LoopSummary> {
        self.recover_orphans()?;
        let mut summary = LoopSummary::default();
        loop {
            if self.supervisor.is_cancelled() {
                summary.stopped = true;
                break;
            }
            summary.cycles += 1;
            match self.run_cycle(options.dry_run).await {
                Ok(CycleOutcome::Processed(done)) => {
                    summary.processed += 1;
                    info!(task_id = %done.task_id, result = ?done.result, "task processed");
                }
                Ok(CycleOutcome::Stopped { task_id }) => {
                    info!(task_id = %task_id, "stopped mid-task");
                    summary.stopped = true;
                    break;
                }
                Ok(outcome) => debug!(?outcome, "cycle finished"),
                Err(err) => error!(err = %format!("{err:#}"), "scheduler cycle failed"),
            }

            if options.once {
                break;
            }
            if let Some(max) = options.max_tasks
                && summary.processed >= max
            {
                info!(max, "task cap reached");
                break;
            }
            self.idle(watcher).await;
        }
        info!(
            cycles = summary.cycles,
            processed = summary.processed,
            stopped = summary.stopped,
            "scheduler loop finished"
        );
        Ok(summary)
    }

    /// One scheduling decision, and the run of the selected task if any.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, dry_run: bool) -> Result<CycleOutcome> {
        self.on_git(|vcs| vcs.heal()).await?;
        self.sweep_retries()?;

        if let Some(busy) = self.store.list(TaskStatus::InProgress)?.into_iter().next() {
            debug!(task_id = %busy.id, "a task is already in progress");
            return Ok(CycleOutcome::Busy { task_id: busy.id });
        }

        let all = self.store.list_all()?;
        let selection = select_candidate(&all);
        for (id, reason) in &selection.skipped {
            match reason {
                Eligibility::OnCycle(members) => {
                    warn!(task_id = %id, cycle = %members.join(" -> "), "circular dependency, skipping");
                }
                Eligibility::BlockedBy(deps) => {
                    info!(task_id = %id, "blocked by {}", deps.join(", "));
                }
                Eligibility::Eligible => {}
            }
        }

        let Some(task) = selection.selected else {
            return Ok(CycleOutcome::Idle {
                skipped: selection.skipped,
            });
        };
        if dry_run {
            info!(task_id = %task.id, title = %task.title, "dry run: would start task");
            return Ok(CycleOutcome::DryRun {
                task_id: task.id,
                skipped: selection.skipped,
            });
        }
        self.process(task).await
    }

    /// Move due `review` tasks back to `todo`.
    fn sweep_retries(&self) -> Result<()> {
        let now = Utc::now();
        let review = self.store.list(TaskStatus::Review)?;
        for id in self.retry.sweep(&review, now) {
            let Some(mut task) = review.iter().find(|t| t.id == id).cloned() else {
                continue;
            };
            mark_retried(&mut task, now);
            self.store.update(&task)?;
            info!(task_id = %id, retry_count = task.retry_count, "auto-retry: back to todo");
        }
        Ok(())
    }

    /// Tasks left `in_progress` by a scheduler that died go back to `todo`.
    /// Only called while holding the lease, so nothing else can be running them.
    fn recover_orphans(&self) -> Result<()> {
        for mut task in self.store.list(TaskStatus::InProgress)? {
            warn!(task_id = %task.id, "recovering task left in progress");
            task.status = TaskStatus::Todo;
            self.store.update(&task)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn process(&self, mut task: Task) -> Result<CycleOutcome> {
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        self.store.update(&task)?;
        info!(title = %task.title, "task started");

        let outcome = AssertUnwindSafe(self.execute(&task)).catch_unwind().await;
        let report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(err)) if err.downcast_ref::<CancelledError>().is_some() => {
                task.status = TaskStatus::Todo;
                self.store.update(&task)?;
                info!("task returned to todo after stop");
                return Ok(CycleOutcome::Stopped { task_id: task.id });
            }
            Ok(Err(err)) => {
                error!(err = %format!("{err:#}"), "task processing failed");
                error_report(format!("{err:#}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "task processing panicked");
                if let Err(err) = self.on_git(|vcs| vcs.heal()).await {
                    warn!(err = %format!("{err:#}"), "heal after panic failed");
                }
                error_report(format!("panic: {message}"))
            }
        };

        let finished = Utc::now();
        apply_report(&mut task, &report, finished);
        self.store.update(&task)?;
        info!(status = %task.status, result = ?report.result, "task finished");

        let processed = ProcessedTask {
            task_id: task.id.clone(),
            result: report.result,
            status: task.status,
        };
        if let Err(err) = self.history.append(&task.id, report.into_record(finished)) {
            warn!(err = %format!("{err:#}"), "failed to append history record");
        }
        Ok(CycleOutcome::Processed(processed))
    }

    /// Branch, run the engine, then integrate or discard the work.
    async fn execute(&self, task: &Task) -> Result<TaskReport> {
        let owned = task.clone();
        let checkout = self.on_git(move |vcs| vcs.begin(&owned)).await?;
        let run = AssertUnwindSafe(self.engine.run_task(task, &self.supervisor))
            .catch_unwind()
            .await;
        let report = match run {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                self.abort(&checkout).await;
                return Err(err);
            }
            Err(panic) => {
                self.abort(&checkout).await;
                return Err(anyhow!("phase engine panicked: {}", panic_message(panic.as_ref())));
            }
        };

        if !report.result.keeps_work() {
            self.abort(&checkout).await;
            return Ok(report);
        }
        let owned = task.clone();
        match self
            .on_git(move |vcs| vcs.finish_success(&checkout, &owned))
            .await
        {
            Ok(_) => Ok(report),
            Err(err) => Ok(integration_failed(report, format!("{err:#}"))),
        }
    }

    async fn abort(&self, checkout: &TaskCheckout) {
        let checkout = checkout.clone();
        let aborted = self
            .on_git(move |vcs| {
                vcs.abort(&checkout);
                Ok(())
            })
            .await;
        if let Err(err) = aborted {
            error!(err = %format!("{err:#}"), "abort did not complete");
        }
    }

    /// Run a git lifecycle step on the blocking pool.
    async fn on_git<T, F>(&self, step: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&VcsLifecycle) -> Result<T> + Send + 'static,
    {
        let vcs = self.vcs.clone();
        tokio::task::spawn_blocking(move || step(&vcs))
            .await
            .context("git step did not complete")?
    }

    /// Sleep the poll interval, waking early on task changes or a stop.
    async fn idle(&self, watcher: Option<&TaskWatcher>) {
        let changed = async {
            match watcher {
                Some(watcher) => watcher.changed().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = changed => debug!("woken by task change"),
            _ = self.supervisor.cancelled() => {}
        }
    }
}

/// Persist the run's outcome on the task record.
pub fn apply_report(task: &mut Task, report: &TaskReport, at: chrono::DateTime<Utc>) {
    task.status = report.result.target_status();
    task.completed_at = Some(at);
    task.last_attempt_at = Some(at);
    task.iterations = report.iterations;
    if report.result == RunResult::Success {
        task.last_error = None;
        task.last_error_phase = None;
    } else {
        task.last_error = Some(
            report
                .error
                .clone()
                .unwrap_or_else(|| report.summary.clone()),
        );
        task.last_error_phase = report.error_phase;
        task.retry_count += 1;
    }
}

fn error_report(message: String) -> TaskReport {
    TaskReport {
        result: RunResult::Failed,
        iterations: 0,
        phases: PhaseLog::default(),
        summary: message.lines().next().unwrap_or_default().to_string(),
        error: Some(message),
        error_phase: None,
        duration: Duration::ZERO,
    }
}

/// Work passed every phase but could not be committed or merged.
fn integration_failed(mut report: TaskReport, err: String) -> TaskReport {
    report.result = RunResult::Failed;
    report.summary = format!("integration failed: {}", err.lines().next().unwrap_or_default());
    report.error = Some(format!("integration failed: {err}"));
    report
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
