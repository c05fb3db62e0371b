//! Scheduler liveness marker (`.taskpilot/scheduler.pid`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::fsutil::write_atomic;
use crate::errors::AlreadyRunningError;

/// Held for the lifetime of a scheduler. Dropping it removes the marker if
/// the marker still names this process.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    pid: u32,
}

impl Lease {
    /// Write our pid to `path`.
    ///
    /// Fails with [`AlreadyRunningError`] if the marker names another live
    /// process. A marker pointing at a dead process is taken over.
    pub fn acquire(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        if let Some(holder) = read_pid(path)?
            && holder != pid
        {
            if is_process_alive(holder) {
                return Err(AlreadyRunningError { pid: holder }.into());
            }
            warn!(stale_pid = holder, "taking over stale scheduler marker");
        }
        write_atomic(path, format!("{pid}\n").as_bytes())?;
        info!(pid, path = %path.display(), "scheduler lease acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(err = %err, "failed to remove scheduler marker");
                } else {
                    debug!(path = %self.path.display(), "scheduler lease released");
                }
            }
            _ => debug!("scheduler marker no longer ours, leaving it"),
        }
    }
}

/// Pid of the live scheduler, if any. Stale or unreadable markers count as absent.
pub fn running_scheduler(path: &Path) -> Result<Option<u32>> {
    Ok(read_pid(path)?.filter(|pid| is_process_alive(*pid)))
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => {
            warn!(path = %path.display(), "unparseable scheduler marker");
            Ok(None)
        }
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Ask the running scheduler to stop (SIGTERM). Returns the pid signalled.
#[cfg(unix)]
pub fn signal_stop(path: &Path) -> Result<Option<u32>> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = running_scheduler(path)? else {
        return Ok(None);
    };
    let raw = i32::try_from(pid).context("pid out of range")?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .with_context(|| format!("signal scheduler pid {pid}"))?;
    Ok(Some(pid))
}

#[cfg(not(unix))]
pub fn signal_stop(_path: &Path) -> Result<Option<u32>> {
    anyhow::bail!("stop is only supported on unix")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_drop_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scheduler.pid");
        {
            let lease = Lease::acquire(&path).expect("acquire");
            let written = fs::read_to_string(&path).expect("read");
            assert_eq!(written.trim(), lease.pid().to_string());
            assert_eq!(running_scheduler(&path).expect("running"), Some(lease.pid()));
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_foreign_pid_blocks_acquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scheduler.pid");
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        fs::write(&path, format!("{}\n", child.id())).expect("write");

        let err = Lease::acquire(&path).expect_err("should be held");
        let held = err.downcast_ref::<AlreadyRunningError>().expect("typed error");
        assert_eq!(held.pid, child.id());

        child.kill().expect("kill");
        child.wait().expect("wait");
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scheduler.pid");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead = child.id();
        child.wait().expect("wait");
        fs::write(&path, format!("{dead}\n")).expect("write");

        assert_eq!(running_scheduler(&path).expect("running"), None);
        let lease = Lease::acquire(&path).expect("acquire");
        assert_eq!(lease.pid(), std::process::id());
    }

    #[test]
    fn garbage_marker_counts_as_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scheduler.pid");
        fs::write(&path, "not a pid").expect("write");
        assert_eq!(running_scheduler(&path).expect("running"), None);
        let _lease = Lease::acquire(&path).expect("acquire");
    }
}
