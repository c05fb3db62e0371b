//! Git adapter for the version-control lifecycle.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every call is
//! bounded by a timeout so a hung git (credential prompt, lock) cannot stall
//! the scheduler.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use super::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT: usize = 1_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    /// Current branch name, or `None` on a detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        debug!(branch = %name, "current branch");
        Ok(Some(name))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// True while a merge is stopped on conflicts.
    pub fn merge_in_progress(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?
            .status
            .success())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Whether `name` is acceptable to git as a branch name.
    pub fn is_valid_branch_name(&self, name: &str) -> Result<bool> {
        Ok(self
            .run(&["check-ref-format", "--branch", name])?
            .status
            .success())
    }

    /// True if every commit on `branch` is reachable from `base`.
    pub fn is_merged_into(&self, branch: &str, base: &str) -> Result<bool> {
        Ok(self
            .run(&["merge-base", "--is-ancestor", branch, base])?
            .status
            .success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Checkout discarding local modifications.
    pub fn checkout_force(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "-f", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git merge --no-ff` of `branch` into the current branch.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run_checked(&["merge", "--no-ff", "-m", message, branch])?;
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    /// Stash tracked and untracked changes. Returns false if nothing was stashed.
    pub fn stash_push(&self, message: &str) -> Result<bool> {
        let before = self.stash_depth()?;
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(self.stash_depth()? > before)
    }

    pub fn stash_pop(&self) -> Result<()> {
        self.run_checked(&["stash", "pop"])?;
        Ok(())
    }

    fn stash_depth(&self) -> Result<usize> {
        let out = self.run_capture(&["stash", "list"])?;
        Ok(out.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// `merge --abort`; succeeds quietly when no merge is in progress.
    pub fn merge_abort(&self) -> Result<()> {
        if self.merge_in_progress()? {
            self.run_checked(&["merge", "--abort"])?;
        }
        Ok(())
    }

    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard"])?;
        Ok(())
    }

    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT)
            .map_err(|err| anyhow!("spawn git {}: {err:#}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn stash_round_trip_reports_whether_anything_was_saved() {
        let repo = TestRepo::new();
        let git = repo.git();
        assert!(!git.stash_push("empty").expect("stash"));

        repo.write("scratch.txt", "wip\n");
        assert!(!git.is_clean().expect("status"));
        assert!(git.stash_push("wip").expect("stash"));
        assert!(git.is_clean().expect("status"));
        git.stash_pop().expect("pop");
        assert!(repo.path().join("scratch.txt").exists());
    }

    #[test]
    fn merged_branch_detection() {
        let repo = TestRepo::new();
        let git = repo.git();
        git.checkout_new_branch("task/x").expect("branch");
        assert!(git.is_merged_into("task/x", "main").expect("merged"));

        repo.write("x.txt", "x\n");
        git.add_all().expect("add");
        assert!(git.commit_staged("x").expect("commit"));
        assert!(!git.is_merged_into("task/x", "main").expect("merged"));
        assert_eq!(
            git.current_branch().expect("branch").as_deref(),
            Some("task/x")
        );
    }

    #[test]
    fn merge_abort_without_merge_is_noop() {
        let repo = TestRepo::new();
        repo.git().merge_abort().expect("abort");
    }
}
