//! External tool invocation with timeouts, cancellation and captured stderr.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a tool gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
    #[error("I/O error running tool: {0}")]
    Io(#[from] std::io::Error),
}

/// One external process run.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Redirect stdout into this file instead of discarding it
    pub stdout_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdout_file: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub stderr: String,
    pub elapsed: Duration,
}

/// Run a tool to completion.
///
/// The timeout kills the process. Cancellation sends SIGTERM, then kills it if it
/// has not exited within a grace period.
pub async fn run_tool(
    invocation: &ToolInvocation,
    cancel: &CancellationToken,
    max_error_output: usize,
) -> Result<ToolOutput, ToolError> {
    let program = invocation.program.clone();
    let started = Instant::now();

    let stdout = match &invocation.stdout_file {
        Some(path) => Stdio::from(std::fs::File::create(path)?),
        None => Stdio::null(),
    };

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    debug!(program = %program, pid = ?child.id(), "Tool started");

    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::time::sleep(invocation.timeout) => {
            warn!(program = %program, timeout_secs = invocation.timeout.as_secs(), "Tool timed out, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ToolError::Timeout {
                program,
                secs: invocation.timeout.as_secs(),
            });
        }
        _ = cancel.cancelled() => {
            warn!(program = %program, "Cancellation requested, terminating tool");
            terminate(&mut child).await;
            return Err(ToolError::Cancelled { program });
        }
    };

    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let stderr = truncate_output(&String::from_utf8_lossy(&stderr_bytes), max_error_output);

    if !status.success() {
        return Err(ToolError::Exit {
            program,
            code: status.code(),
            stderr,
        });
    }

    Ok(ToolOutput {
        stderr,
        elapsed: started.elapsed(),
    })
}

async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Trim tool output to at most `max` bytes, keeping the head, on a char boundary.
pub fn truncate_output(output: &str, max: usize) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }

    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &trimmed[..end])
}
