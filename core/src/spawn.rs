//! Child-process plumbing shared by the runtime backends, the VCS backends,
//! and the SSH wrapper.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ForageErr;
use crate::error::Result;

/// Captured outcome of a child process. A non-zero exit code is a value, not
/// an error; only failure to run the child at all is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    /// When set the child's environment is cleared and replaced; otherwise it
    /// inherits the parent environment.
    pub env: Option<HashMap<String, String>>,
    pub stdin: Option<Vec<u8>>,
}

/// Run `program args…`, capture stdout/stderr, and wait for exit.
///
/// Cancellation drops the in-flight child; `kill_on_drop` ensures the process
/// dies with it, and the call surfaces `ForageErr::Cancelled`.
pub async fn run_captured(
    program: &str,
    args: &[String],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<ExecResult> {
    trace!("run_captured: {program} {args:?}");
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdin(if options.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(data) = options.stdin.clone()
        && let Some(mut stdin) = child.stdin.take()
    {
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
        });
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let wait = async move {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut stdout).await?;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut stderr).await?;
        }
        let status = child.wait().await?;
        std::io::Result::Ok(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    };
    tokio::pin!(wait);

    tokio::select! {
        // Dropping the pinned future drops the child, which kills it.
        _ = cancel.cancelled() => Err(ForageErr::Cancelled),
        result = &mut wait => Ok(result?),
    }
}

/// Run `program args…` with stdio inherited from the caller (interactive).
pub async fn run_inherited(
    program: &str,
    args: &[String],
    env: Option<HashMap<String, String>>,
    cancel: &CancellationToken,
) -> Result<i32> {
    trace!("run_inherited: {program} {args:?}");
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(env) = env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    tokio::select! {
        _ = cancel.cancelled() => Err(ForageErr::Cancelled),
        status = child.wait() => Ok(status?.code().unwrap_or(-1)),
    }
}

/// Run a backend tool and require exit code zero, wrapping any non-zero exit
/// as `BackendFailure` with the tool's stderr.
pub async fn run_checked(
    backend: &str,
    op: &str,
    program: &str,
    args: &[String],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<ExecResult> {
    let result = run_captured(program, args, options, cancel).await?;
    if result.success() {
        Ok(result)
    } else {
        Err(ForageErr::backend(
            backend,
            op,
            Some(result.exit_code),
            result.stderr,
        ))
    }
}

/// Replace the current process with `program args…` via the OS `exec`
/// primitive. The environment is cleared and replaced with `env`; callers
/// pass the filtered environment from [`crate::exec_env`]. Returns only on
/// failure.
pub fn replace_process(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> ForageErr {
    use std::os::unix::process::CommandExt;
    let mut cmd = std::process::Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(env);
    ForageErr::Io(cmd.exec())
}
