//! External process execution with a wall-clock budget.
//!
//! On unix every child leads its own process group. On budget expiry, or when
//! the future is dropped, the whole group is sent SIGKILL, so helpers started
//! by a wrapper script die with it. The leader is then reaped before
//! returning and no zombie is left behind.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

/// How long to wait for pipe readers after killing a timed-out child.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl ExecOutput {
    /// stdout followed by stderr, lossily decoded.
    pub fn combined_output(&self) -> String {
        combine(&self.stdout, &self.stderr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {pid:?} exceeded its {budget_ms}ms budget and was killed")]
    TimedOut {
        pid: Option<u32>,
        budget_ms: u64,
        output: String,
    },

    #[error("io error while waiting for process: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a [`Command`] from an argv vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command, ExecError> {
    let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run `cmd` to completion, killing it if `budget` elapses first.
pub async fn run_with_budget(mut cmd: Command, budget: Option<Duration>) -> Result<ExecOutput, ExecError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.as_std_mut().process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|source| ExecError::Spawn { program, source })?;
    let pid = child.id();
    // Declared after `child` so it drops first, while the leader is unreaped.
    let mut group = ProcessGroup { leader: pid };

    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let status = match budget {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                group.kill();
                // `kill` sends SIGKILL and waits, which reaps the leader.
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "failed to kill timed-out process");
                }
                group.disarm();
                let out = collect(stdout, Some(DRAIN_GRACE)).await;
                let err = collect(stderr, Some(DRAIN_GRACE)).await;
                return Err(ExecError::TimedOut {
                    pid,
                    budget_ms: limit.as_millis() as u64,
                    output: combine(&out, &err),
                });
            }
        },
        None => child.wait().await?,
    };
    // The leader is reaped; its group id may be reused from here on.
    group.disarm();

    let stdout = collect(stdout, None).await;
    let stderr = collect(stderr, None).await;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        success: status.success(),
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Process group led by a spawned child. Dropping it kills the group.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    /// SIGKILL every process in the group. Must run before the leader is reaped.
    #[cfg(unix)]
    fn kill(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(leader) = self.leader else { return };
        match killpg(Pid::from_raw(leader as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pgid = leader, error = %e, "failed to kill process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {}

    fn disarm(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // Partial output is still useful if the read fails midway.
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>, grace: Option<Duration>) -> Vec<u8> {
    match grace {
        Some(limit) => {
            let abort = task.abort_handle();
            match tokio::time::timeout(limit, task).await {
                Ok(res) => res.unwrap_or_default(),
                Err(_) => {
                    // A process that left the group still holds the pipe open.
                    abort.abort();
                    Vec::new()
                }
            }
        }
        None => task.await.unwrap_or_default(),
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&err);
    }
    text
}
