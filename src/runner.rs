use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::AbortSignal;

const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Shell {
    #[default]
    Sh,
    Bash,
}

impl Shell {
    pub const NAMES: &'static [&'static str] = &["sh", "bash"];

    pub fn name(&self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
        }
    }
}

impl FromStr for Shell {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            other => Err(format!(
                "unknown shell '{other}' (expected one of: {})",
                Shell::NAMES.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Name used in log fields; usually the stage name.
    pub label: String,
    pub script: String,
    pub shell: Shell,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub aborted: bool,
    pub spawn_error: Option<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
            && !self.timed_out
            && !self.aborted
            && self.spawn_error.is_none()
    }

    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn execute(&self, request: &CommandRequest, abort: &AbortSignal) -> ProcessOutput;
}

/// Runs commands through `sh -c` / `bash -c` in their own process group so
/// a timeout or abort can take down everything the command spawned.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

enum Interrupt {
    Timeout,
    Abort,
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn execute(&self, request: &CommandRequest, abort: &AbortSignal) -> ProcessOutput {
        let started = Instant::now();
        let program = request.shell.name();

        let mut cmd = Command::new(program);
        cmd.arg("-c")
            .arg(&request.script)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let mut output = ProcessOutput::spawn_failed(format!(
                    "failed to spawn '{program}' in {}: {err}",
                    request.working_dir.display()
                ));
                output.duration = started.elapsed();
                return output;
            }
        };
        let pid = child.id();
        debug!(stage = %request.label, pid = ?pid, "Process spawned");

        let stdout_handle = drain_lines(child.stdout.take(), request.label.clone(), false);
        let stderr_handle = drain_lines(child.stderr.take(), request.label.clone(), true);

        let waited = tokio::select! {
            status = child.wait() => Ok(status),
            _ = deadline(request.timeout) => Err(Interrupt::Timeout),
            _ = abort.aborted() => Err(Interrupt::Abort),
        };

        let mut output = ProcessOutput::default();
        match waited {
            Ok(Ok(status)) => {
                output.exit_code = status.code();
                // background jobs the command left behind still hold the pipes
                kill_group(pid).await;
            }
            Ok(Err(err)) => {
                warn!(stage = %request.label, error = %err, "Failed to wait for process");
                terminate(&mut child, pid).await;
            }
            Err(interrupt) => {
                terminate(&mut child, pid).await;
                match interrupt {
                    Interrupt::Timeout => output.timed_out = true,
                    Interrupt::Abort => output.aborted = true,
                }
            }
        }

        output.stdout = collect(stdout_handle).await;
        output.stderr = collect(stderr_handle).await;
        output.duration = started.elapsed();
        output
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid).await;
    if let Err(err) = child.kill().await {
        debug!(error = %err, "Child already exited");
    }
}

#[cfg(unix)]
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // a negative pid addresses the whole process group
    let group = format!("-{pid}");
    if let Err(err) = Command::new("kill")
        .args(["-KILL", "--", group.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        debug!(error = %err, "Process group kill failed, falling back to child kill");
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: Option<u32>) {}

fn drain_lines<R>(reader: Option<R>, label: String, is_stderr: bool) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = String::new();
        let Some(reader) = reader else {
            return collected;
        };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(stage = %label, "{line}");
            } else {
                info!(stage = %label, "{line}");
            }
            if !collected.is_empty() {
                collected.push('\n');
            }
            collected.push_str(&line);
        }
        collected
    })
}

async fn collect(handle: JoinHandle<String>) -> String {
    let abort_handle = handle.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            debug!(error = %err, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // a detached grandchild is still holding the pipe open
            abort_handle.abort();
            String::new()
        }
    }
}
