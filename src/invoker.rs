//! Run an external program to completion with captured output and a hard
//! deadline.
//!
//! Children are started as session leaders so that termination reaches the
//! whole process group (agent CLIs commonly fork helpers). Every return path
//! terminates what it started.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};

use crate::error::{AgentError, Result};

/// How long a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for pipe readers after the child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            working_dir: None,
            timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl InvokeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawn `request.program`, feed it the stdin payload and wait for it to exit.
///
/// On timeout the process group is terminated and the error carries whatever
/// stdout was captured so far as `raw_text`.
pub async fn invoke(request: &InvokeRequest) -> Result<InvokeOutput> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &request.working_dir {
        cmd.current_dir(dir);
    }
    become_session_leader(&mut cmd);

    let mut child = cmd.spawn().map_err(|error| {
        AgentError::spawn(format!("failed to spawn `{}`: {error}", request.program))
    })?;
    tracing::debug!(
        target = "agent_gateway::invoker",
        program = %request.program,
        pid = ?child.id(),
        "spawned one-shot process"
    );

    let stdin_task = match (child.stdin.take(), request.stdin.clone()) {
        (Some(mut stdin), Some(payload)) => Some(tokio::spawn(async move {
            // The child may exit without reading its input; EPIPE is fine.
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        })),
        _ => None,
    };

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| spawn_capture(out, Arc::clone(&stdout_buf)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| spawn_capture(err, Arc::clone(&stderr_buf)));

    let waited = timeout(request.timeout, child.wait()).await;
    if let Some(task) = stdin_task {
        task.abort();
    }

    match waited {
        Ok(Ok(status)) => {
            finish_capture(stdout_task).await;
            finish_capture(stderr_task).await;
            Ok(InvokeOutput {
                exit_code: status.code(),
                stdout: lossy(&stdout_buf),
                stderr: lossy(&stderr_buf),
            })
        }
        Ok(Err(error)) => {
            terminate_child(&mut child, DEFAULT_KILL_GRACE).await;
            finish_capture(stdout_task).await;
            finish_capture(stderr_task).await;
            Err(AgentError::spawn(format!(
                "failed waiting on `{}`: {error}",
                request.program
            )))
        }
        Err(_) => {
            terminate_child(&mut child, DEFAULT_KILL_GRACE).await;
            finish_capture(stdout_task).await;
            finish_capture(stderr_task).await;
            let partial = lossy(&stdout_buf);
            tracing::warn!(
                target = "agent_gateway::invoker",
                program = %request.program,
                timeout_ms = request.timeout.as_millis() as u64,
                partial_bytes = partial.len(),
                "one-shot process timed out"
            );
            Err(AgentError::timeout(format!(
                "`{}` did not finish within {}s",
                request.program,
                request.timeout.as_secs_f32()
            ))
            .with_raw_text(partial))
        }
    }
}

/// Terminate a child and its process group: SIGTERM, then SIGKILL once
/// `grace` has elapsed.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    signal_group(child, Signal::SIGTERM);

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        signal_group(child, Signal::SIGKILL);

        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Signal the child's process group, falling back to the child alone when it
/// is not a group leader.
#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        if killpg(pid, signal).is_err() {
            let _ = kill(pid, signal);
        }
    }
}

/// Detach the child into its own session so its whole group can be signalled.
pub(crate) fn become_session_leader(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if nix::libc::setsid() == -1 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(())
            }
        });
    }

    #[cfg(not(unix))]
    let _ = cmd;
}

fn spawn_capture<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

async fn finish_capture(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn lossy(buf: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&buf.lock()).into_owned()
}
