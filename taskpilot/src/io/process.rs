//! Child process helpers.
//!
//! Two flavors: a blocking runner with a wall-clock timeout for short git
//! commands, and an async supervised runner for agent phases that races the
//! child against a total timeout, an inactivity timeout and cancellation.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::supervisor::Supervisor;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs; bytes beyond
/// `output_limit_bytes` are discarded while the pipe is still drained.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    use std::io::Write;

    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
    }
    Ok(buf)
}

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own; `None` when killed by a signal it did not get from us.
    Exited(Option<i32>),
    TotalTimeout,
    Inactivity,
    Cancelled,
}

/// An agent invocation with its limits.
#[derive(Debug, Clone)]
pub struct SupervisedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub total_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub kill_grace: Duration,
    /// Trailing bytes of combined output kept in memory.
    pub output_limit_bytes: usize,
    /// Stream output to the console as it arrives.
    pub echo: bool,
    /// Full combined output is appended here when set.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SupervisedOutput {
    pub termination: Termination,
    /// Tail of the combined stdout/stderr, at most `output_limit_bytes`.
    pub output: String,
    pub dropped_bytes: usize,
    pub duration: Duration,
}

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn into_string(self) -> (String, usize) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.dropped)
    }
}

/// Run an agent phase under supervision.
///
/// The child gets its own process group so termination reaches anything it
/// spawned. On timeout or cancellation the group receives SIGTERM, then
/// SIGKILL once `kill_grace` has passed.
#[instrument(skip_all, fields(program = %spec.program, total_secs = spec.total_timeout.as_secs(), inactivity_secs = spec.inactivity_timeout.as_secs()))]
pub async fn run_supervised(
    spec: &SupervisedCommand,
    supervisor: &Supervisor,
) -> Result<SupervisedOutput> {
    let started = Instant::now();
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn agent {}", spec.program))?;
    let pid = child.id();
    debug!(?pid, "agent spawned");

    if let Some(input) = spec.stdin.clone()
        && let Some(mut stdin) = child.stdin.take()
    {
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(input.as_bytes()).await {
                warn!(err = %err, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        });
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let mut sink = OutputSink::open(spec).await?;

    let total = tokio::time::sleep(spec.total_timeout);
    tokio::pin!(total);
    let inactivity = tokio::time::sleep(spec.inactivity_timeout);
    tokio::pin!(inactivity);
    let mut streams_open = true;

    let termination = loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some(bytes) => {
                    inactivity
                        .as_mut()
                        .reset(tokio::time::Instant::now() + spec.inactivity_timeout);
                    sink.write(&bytes).await;
                }
                None => streams_open = false,
            },
            status = child.wait() => {
                break Termination::Exited(status.context("wait for agent")?.code());
            }
            _ = &mut total => break Termination::TotalTimeout,
            _ = &mut inactivity => break Termination::Inactivity,
            _ = supervisor.cancelled() => break Termination::Cancelled,
        }
    };

    match termination {
        Termination::Exited(code) => debug!(?code, "agent exited"),
        other => {
            warn!(?other, ?pid, "terminating agent");
            terminate(&mut child, pid, spec.kill_grace).await;
        }
    }

    // Grandchildren may keep the pipes open; drain briefly, then give up.
    while let Ok(Some(bytes)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
        sink.write(&bytes).await;
    }

    let (output, dropped_bytes) = sink.finish().await;
    let duration = started.elapsed();
    info!(
        ?termination,
        duration_ms = duration.as_millis() as u64,
        dropped_bytes,
        "agent finished"
    );
    Ok(SupervisedOutput {
        termination,
        output,
        dropped_bytes,
        duration,
    })
}

/// Run a command attached to the terminal (interactive engines).
///
/// Nothing is captured; the outcome is the exit code alone.
#[instrument(skip_all, fields(program = %program))]
pub async fn run_inherited(
    program: &str,
    args: &[String],
    cwd: &std::path::Path,
    total_timeout: Duration,
    kill_grace: Duration,
    supervisor: &Supervisor,
) -> Result<(Termination, Duration)> {
    let started = Instant::now();
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).current_dir(cwd).kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn interactive agent {program}"))?;
    let pid = child.id();

    let termination = tokio::select! {
        status = child.wait() => Termination::Exited(status.context("wait for agent")?.code()),
        _ = tokio::time::sleep(total_timeout) => Termination::TotalTimeout,
        _ = supervisor.cancelled() => Termination::Cancelled,
    };
    if !matches!(termination, Termination::Exited(_)) {
        terminate(&mut child, pid, kill_grace).await;
    }
    Ok((termination, started.elapsed()))
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(err = %err, "agent output stream closed");
                break;
            }
        }
    }
}

/// Fan-out of agent output: in-memory tail, console, optional log file.
struct OutputSink {
    tail: TailBuffer,
    echo: Option<tokio::io::Stdout>,
    log: Option<tokio::fs::File>,
}

impl OutputSink {
    async fn open(spec: &SupervisedCommand) -> Result<Self> {
        let log = match &spec.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("create log dir {}", parent.display()))?;
                }
                Some(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("create log {}", path.display()))?,
                )
            }
            None => None,
        };
        Ok(Self {
            tail: TailBuffer::new(spec.output_limit_bytes),
            echo: spec.echo.then(tokio::io::stdout),
            log,
        })
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.tail.push(bytes);
        if let Some(out) = self.echo.as_mut()
            && let Err(err) = out.write_all(bytes).await
        {
            debug!(err = %err, "console echo failed");
            self.echo = None;
        }
        if let Some(file) = self.log.as_mut()
            && let Err(err) = file.write_all(bytes).await
        {
            warn!(err = %err, "failed to write agent log");
            self.log = None;
        }
    }

    async fn finish(mut self) -> (String, usize) {
        if let Some(out) = self.echo.as_mut() {
            let _ = out.flush().await;
        }
        if let Some(file) = self.log.as_mut() {
            let _ = file.flush().await;
        }
        self.tail.into_string()
    }
}

async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, false);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(?pid, "agent stopped after SIGTERM"),
        Err(_) => {
            warn!(?pid, grace_secs = grace.as_secs(), "agent ignored SIGTERM, killing");
            signal_group(pid, true);
            if let Err(err) = child.kill().await {
                debug!(err = %err, "kill after SIGKILL");
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(err = %err, pid, "signal process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> SupervisedCommand {
        SupervisedCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            stdin: None,
            total_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
            output_limit_bytes: 10_000,
            echo: false,
            log_path: None,
        }
    }

    #[test]
    fn tail_buffer_keeps_the_end() {
        let mut tail = TailBuffer::new(5);
        tail.push(b"abc");
        tail.push(b"defg");
        let (text, dropped) = tail.into_string();
        assert_eq!(text, "cdefg");
        assert_eq!(dropped, 2);
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run_supervised(&sh("echo hello; echo oops >&2; exit 3"), &Supervisor::new())
            .await
            .expect("run");
        assert_eq!(out.termination, Termination::Exited(Some(3)));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn prompt_is_delivered_on_stdin() {
        let mut spec = sh("cat");
        spec.stdin = Some("the prompt\n".to_string());
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.termination, Termination::Exited(Some(0)));
        assert_eq!(out.output, "the prompt\n");
    }

    #[tokio::test]
    async fn inactivity_timeout_fires_on_silence() {
        let mut spec = sh("echo start; sleep 30");
        spec.inactivity_timeout = Duration::from_millis(300);
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.termination, Termination::Inactivity);
        assert!(out.output.contains("start"));
        assert!(out.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_keeps_inactivity_timer_alive() {
        let mut spec = sh("for i in 1 2 3 4 5; do echo $i; sleep 0.2; done");
        spec.inactivity_timeout = Duration::from_millis(800);
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.termination, Termination::Exited(Some(0)));
    }

    #[tokio::test]
    async fn total_timeout_fires_despite_output() {
        let mut spec = sh("while true; do echo tick; sleep 0.1; done");
        spec.total_timeout = Duration::from_millis(500);
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.termination, Termination::TotalTimeout);
    }

    #[tokio::test]
    async fn sigterm_is_escalated_to_sigkill() {
        let mut spec = sh("trap '' TERM; echo ready; while true; do sleep 0.1; done");
        spec.total_timeout = Duration::from_millis(400);
        spec.kill_grace = Duration::from_millis(300);
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.termination, Termination::TotalTimeout);
        assert!(out.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_stops_the_agent() {
        let supervisor = Supervisor::new();
        let canceller = supervisor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let out = run_supervised(&sh("sleep 30"), &supervisor).await.expect("run");
        assert_eq!(out.termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn full_output_is_written_to_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = sh("echo one; echo two");
        spec.output_limit_bytes = 4;
        spec.log_path = Some(temp.path().join("logs").join("code-1.log"));
        let out = run_supervised(&spec, &Supervisor::new()).await.expect("run");
        assert_eq!(out.output, "two\n");
        let log = std::fs::read_to_string(temp.path().join("logs/code-1.log")).expect("log");
        assert_eq!(log, "one\ntwo\n");
    }

    #[test]
    fn blocking_runner_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_command_with_timeout(cmd, None, Duration::from_millis(200), 100).expect("run");
        assert!(out.timed_out);
    }
}
