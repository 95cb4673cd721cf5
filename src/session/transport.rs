//! How a persistent agent process is started and wired up.
//!
//! A launcher hands the session manager a byte channel pair: `inbound` is
//! written by the manager and read by the agent as stdin, `outbound` is the
//! agent's stdout. The roles never swap.

use std::{path::PathBuf, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    process::{Child, ChildStderr, Command},
};

use crate::{
    backend::Invocation,
    error::{AgentError, Result},
    invoker::become_session_leader,
};

pub type Inbound = Box<dyn AsyncWrite + Send + Unpin>;
pub type Outbound = Box<dyn AsyncRead + Send + Unpin>;

pub struct SessionChannels {
    pub inbound: Inbound,
    pub outbound: Outbound,
    /// `None` for in-process agents (tests).
    pub process: Option<Child>,
}

/// Starts one agent process per call. Called again on every restart.
pub trait AgentLauncher: Send + Sync + 'static {
    fn launch(&self) -> Result<SessionChannels>;

    /// Remove any coordination artifacts left by `launch`.
    fn cleanup(&self) {}

    fn describe(&self) -> String;
}

/// Program, argv and working directory of the persistent agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn from_invocation(invocation: Invocation) -> Self {
        Self {
            program: invocation.program,
            args: invocation.args,
            working_dir: None,
            env: Vec::new(),
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

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        become_session_leader(&mut cmd);
        cmd
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Talks to the agent over its own stdin/stdout pipes.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    command: AgentCommand,
}

impl StdioLauncher {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }
}

impl AgentLauncher for StdioLauncher {
    fn launch(&self) -> Result<SessionChannels> {
        let mut cmd = self.command.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|error| {
            AgentError::spawn(format!(
                "failed to spawn `{}`: {error}",
                self.command.program
            ))
        })?;

        let inbound = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::spawn("agent stdin was not captured"))?;
        let outbound = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::spawn("agent stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, child.id());
        }

        Ok(SessionChannels {
            inbound: Box::new(inbound),
            outbound: Box::new(outbound),
            process: Some(child),
        })
    }

    fn describe(&self) -> String {
        format!("stdio: {}", self.command.display())
    }
}

/// Talks to the agent through two named pipes at well-known paths, so that
/// external tools can observe the same coordination artifacts.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct FifoLauncher {
    command: AgentCommand,
    input: PathBuf,
    output: PathBuf,
}

#[cfg(unix)]
impl FifoLauncher {
    pub const DEFAULT_INPUT: &'static str = "/tmp/agent-in";
    pub const DEFAULT_OUTPUT: &'static str = "/tmp/agent-out";

    pub fn new(command: AgentCommand, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            command,
            input: input.into(),
            output: output.into(),
        }
    }

    fn make_fifo(path: &std::path::Path) -> Result<()> {
        use nix::{sys::stat::Mode, unistd::mkfifo};

        if path.exists() {
            std::fs::remove_file(path).map_err(|error| {
                AgentError::spawn(format!("failed to remove stale {}: {error}", path.display()))
            })?;
        }
        mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|error| {
            AgentError::spawn(format!("failed to create fifo {}: {error}", path.display()))
        })
    }
}

#[cfg(unix)]
impl AgentLauncher for FifoLauncher {
    fn launch(&self) -> Result<SessionChannels> {
        use tokio::net::unix::pipe;

        Self::make_fifo(&self.input)?;
        Self::make_fifo(&self.output)?;
        let fifo_error = |path: &std::path::Path, error: std::io::Error| {
            AgentError::spawn(format!("failed to open fifo {}: {error}", path.display()))
        };

        // Reader first: a non-blocking read end lets the blocking write-side
        // open below complete immediately.
        let outbound = pipe::OpenOptions::new()
            .open_receiver(&self.output)
            .map_err(|error| fifo_error(&self.output, error))?;
        let agent_stdout = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.output)
            .map_err(|error| fifo_error(&self.output, error))?;
        // Read-write so the open does not wait for a writer.
        let agent_stdin = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.input)
            .map_err(|error| fifo_error(&self.input, error))?;

        let mut cmd = self.command.command();
        cmd.stdin(Stdio::from(agent_stdin))
            .stdout(Stdio::from(agent_stdout))
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|error| {
            AgentError::spawn(format!(
                "failed to spawn `{}`: {error}",
                self.command.program
            ))
        })?;
        // Drop our copies of the agent's ends so EOF is observed on exit.
        drop(cmd);

        let inbound = pipe::OpenOptions::new()
            .open_sender(&self.input)
            .map_err(|error| fifo_error(&self.input, error))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, child.id());
        }

        tracing::debug!(
            target = "agent_gateway::session",
            input = %self.input.display(),
            output = %self.output.display(),
            pid = ?child.id(),
            "agent attached to fifos"
        );
        Ok(SessionChannels {
            inbound: Box::new(inbound),
            outbound: Box::new(outbound),
            process: Some(child),
        })
    }

    fn cleanup(&self) {
        for path in [&self.input, &self.output] {
            if let Err(error) = std::fs::remove_file(path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        target = "agent_gateway::session",
                        path = %path.display(),
                        error = %error,
                        "failed to remove fifo"
                    );
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "fifo {} -> {}: {}",
            self.input.display(),
            self.output.display(),
            self.command.display()
        )
    }
}

fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target = "agent_gateway::session", pid = ?pid, "agent stderr: {line}");
        }
    });
}
