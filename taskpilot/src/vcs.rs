//! Branch lifecycle around one task run.
//!
//! `begin` leaves the worktree on a fresh task branch cut from base.
//! `finish_success` commits and integrates; `abort` discards everything.
//! Both end with the worktree clean and on base, forcing it there if a
//! step left it otherwise.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Task;
use crate::io::config::VcsConfig;
use crate::io::git::Git;

/// Prefix of the error raised when an unmerged task branch is in the way.
pub const BRANCH_EXISTS: &str = "branch-already-exists";

/// State carried from `begin` to `finish_success` / `abort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCheckout {
    pub branch: String,
    /// Whether pre-existing local changes were stashed.
    pub stashed: bool,
}

/// What `finish_success` did with the task's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Integration {
    pub committed: bool,
    pub pushed: bool,
    pub merged: bool,
    /// The task branch still exists locally.
    pub branch_kept: bool,
}

#[derive(Debug, Clone)]
pub struct VcsLifecycle {
    git: Git,
    base: String,
    cfg: VcsConfig,
}

impl VcsLifecycle {
    pub fn new(git: Git, base: impl Into<String>, cfg: VcsConfig) -> Self {
        Self {
            git,
            base: base.into(),
            cfg,
        }
    }

    /// True if the worktree is clean and on base.
    pub fn verify(&self) -> Result<bool> {
        let on_base = self.git.current_branch()?.as_deref() == Some(self.base.as_str());
        Ok(on_base && !self.git.merge_in_progress()? && self.git.is_clean()?)
    }

    /// Force the worktree clean and onto base. Returns true if anything had
    /// to change. Uncommitted edits are stashed rather than thrown away.
    #[instrument(skip_all, fields(base = %self.base))]
    pub fn heal(&self) -> Result<bool> {
        if self.verify()? {
            return Ok(false);
        }
        warn!(
            branch = ?self.git.current_branch().ok().flatten(),
            "worktree not clean on base, forcing"
        );
        if !self.git.merge_in_progress()? && !self.git.is_clean()? {
            match self.git.stash_push("taskpilot: heal") {
                Ok(true) => info!("uncommitted changes stashed"),
                Ok(false) => {}
                Err(err) => warn!(err = %format!("{err:#}"), "stash failed, discarding"),
            }
        }
        self.force_base()?;
        if !self.verify()? {
            return Err(anyhow!("worktree still not clean on {} after heal", self.base));
        }
        Ok(true)
    }

    /// Stash local changes, check out base and cut the task branch.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn begin(&self, task: &Task) -> Result<TaskCheckout> {
        let branch = task.branch_name();
        self.check_branch_name(&branch)?;
        let stashed = if self.git.is_clean()? {
            false
        } else {
            self.git
                .stash_push(&format!("taskpilot: before {}", task.id))?
        };
        let checkout = TaskCheckout { branch, stashed };

        if let Err(err) = self.cut_branch(&checkout.branch) {
            self.restore(&checkout);
            return Err(err);
        }
        info!(branch = %checkout.branch, stashed, "task branch created");
        Ok(checkout)
    }

    /// Reject task branches that git would read as an option, that would
    /// clobber base, or that are not valid ref names.
    fn check_branch_name(&self, branch: &str) -> Result<()> {
        if branch.starts_with('-') {
            return Err(anyhow!("invalid task branch '{branch}': must not start with '-'"));
        }
        if branch == self.base {
            return Err(anyhow!("invalid task branch '{branch}': it is the base branch"));
        }
        if !self.git.is_valid_branch_name(branch)? {
            return Err(anyhow!("invalid task branch '{branch}': not a valid ref name"));
        }
        Ok(())
    }

    fn cut_branch(&self, branch: &str) -> Result<()> {
        self.git.checkout_branch(&self.base)?;
        if self.git.branch_exists(branch)? {
            if !self.git.is_merged_into(branch, &self.base)? {
                return Err(anyhow!("{BRANCH_EXISTS}: {branch} has unmerged work"));
            }
            debug!(branch, "deleting leftover merged branch");
            self.git.delete_branch(branch, false)?;
        }
        self.git.checkout_new_branch(branch)
    }

    /// Commit the task's work and integrate it per configuration.
    ///
    /// Any git failure runs the abort path and is returned as an error, so
    /// success is never reported for work that was not integrated.
    #[instrument(skip_all, fields(task_id = %task.id, branch = %checkout.branch))]
    pub fn finish_success(&self, checkout: &TaskCheckout, task: &Task) -> Result<Integration> {
        match self.integrate(checkout, task) {
            Ok(integration) => {
                info!(?integration, "task work integrated");
                self.restore(checkout);
                Ok(integration)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "integration failed, aborting");
                self.abort(checkout);
                Err(err.context("integrate task branch"))
            }
        }
    }

    fn integrate(&self, checkout: &TaskCheckout, task: &Task) -> Result<Integration> {
        let branch = checkout.branch.as_str();
        if self.git.current_branch()?.as_deref() != Some(branch) {
            warn!(branch, "agent left the task branch, restoring");
            self.git.checkout_branch(branch)?;
        }

        let message = commit_message(task);
        self.git.add_all()?;
        let mut integration = Integration {
            committed: self.git.commit_staged(&message)?,
            ..Integration::default()
        };

        if self.cfg.push {
            self.git.push(&self.cfg.remote, branch)?;
            integration.pushed = true;
        }

        self.git.checkout_branch(&self.base)?;
        if self.cfg.merge {
            self.git
                .merge_no_ff(branch, &format!("Merge {branch}: {message}"))?;
            integration.merged = true;
            self.git.delete_branch(branch, false)?;
        } else if integration.pushed {
            self.git.delete_branch(branch, true)?;
        } else {
            debug!(branch, "keeping unmerged task branch");
            integration.branch_kept = true;
        }
        Ok(integration)
    }

    /// Discard the task's work and delete its branch. Never fails; problems
    /// are logged and the next cycle's heal retries.
    #[instrument(skip_all, fields(branch = %checkout.branch))]
    pub fn abort(&self, checkout: &TaskCheckout) {
        if let Err(err) = self.force_base() {
            warn!(err = %format!("{err:#}"), "abort could not reset worktree");
        }
        match self.git.branch_exists(&checkout.branch) {
            Ok(true) => {
                if let Err(err) = self.git.delete_branch(&checkout.branch, true) {
                    warn!(err = %format!("{err:#}"), "failed to delete task branch");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "cannot inspect task branch"),
        }
        info!("task work discarded");
        self.restore(checkout);
    }

    fn force_base(&self) -> Result<()> {
        self.git.merge_abort()?;
        self.git.reset_hard()?;
        self.git.clean_untracked()?;
        self.git.checkout_force(&self.base)?;
        self.git.clean_untracked()
    }

    /// Pop the pre-task stash, then make sure we end clean on base.
    fn restore(&self, checkout: &TaskCheckout) {
        if checkout.stashed {
            match self.git.stash_pop() {
                Ok(()) => debug!("local changes restored"),
                Err(err) => warn!(err = %format!("{err:#}"), "stash pop failed, stash kept"),
            }
        }
        match self.verify() {
            Ok(true) => {}
            Ok(false) if checkout.stashed => {
                // Restored local changes make the tree dirty; that is the
                // state the user left it in.
                debug!("worktree carries restored local changes");
            }
            _ => {
                warn!("final verification failed, forcing base");
                if let Err(err) = self.force_base() {
                    warn!(err = %format!("{err:#}"), "forced reset failed");
                }
            }
        }
    }
}

/// `<feat|fix|refactor>(<id>): <title>`
pub fn commit_message(task: &Task) -> String {
    format!(
        "{}({}): {}",
        task.kind.commit_prefix(),
        task.id,
        task.title.trim()
    )
}
