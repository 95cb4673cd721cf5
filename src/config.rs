use std::{
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};

use crate::{
    backend::{parse_agent_command, BackendKind},
    invoker::DEFAULT_KILL_GRACE,
    session::{SessionConfig, TimeoutPolicy},
};

#[derive(Debug, Parser)]
#[command(name = "agent-gateway")]
#[command(about = "OpenAI-compatible gateway for command-line coding agents")]
pub struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the HTTP gateway, optionally backed by a persistent daemon agent.
    Serve(ServeCommand),
    /// Run one agent invocation and print its reply.
    Call(CallCommand),
    /// Run prompts as turns of one persistent agent session.
    Session(SessionCommand),
}

#[derive(Debug, clap::Args, Clone)]
pub struct ServeCommand {
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Bearer key required on /v1 routes; empty disables auth.
    #[arg(long, env = "AGENT_GATEWAY_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Serve every model with this agent.
    #[arg(long, env = "AGENT_GATEWAY_FORCE_AGENT", value_parser = parse_optional_kind)]
    pub force_agent: Option<OptionalKind>,

    /// Override an agent's command line, e.g. `claude=npx @anthropic-ai/claude-code`.
    #[arg(long = "agent-command", value_parser = parse_agent_command)]
    pub agent_commands: Vec<(BackendKind, String)>,

    #[arg(long, default_value_t = 300)]
    pub one_shot_timeout_secs: u64,

    #[command(flatten)]
    pub daemon: DaemonArgs,
}

impl ServeCommand {
    pub fn force_agent(&self) -> Option<BackendKind> {
        self.force_agent.and_then(|kind| kind.0)
    }

    pub fn one_shot_timeout(&self) -> Duration {
        Duration::from_secs(self.one_shot_timeout_secs)
    }
}

/// An agent kind where an empty value means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalKind(pub Option<BackendKind>);

fn parse_optional_kind(raw: &str) -> Result<OptionalKind, String> {
    if raw.trim().is_empty() {
        return Ok(OptionalKind(None));
    }
    raw.parse::<BackendKind>().map(|kind| OptionalKind(Some(kind)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Named pipes at --fifo-in/--fifo-out.
    Fifo,
    /// The agent's own stdin/stdout.
    Stdio,
}

#[derive(Debug, clap::Args, Clone)]
pub struct DaemonArgs {
    /// Keep one persistent agent of this kind running for low-latency calls.
    #[arg(long = "daemon", value_name = "AGENT")]
    pub daemon_agent: Option<BackendKind>,

    #[arg(long)]
    pub daemon_model: Option<String>,

    #[arg(long)]
    pub daemon_cwd: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = TransportKind::Fifo)]
    pub transport: TransportKind,

    #[arg(long, default_value = "/tmp/agent-in")]
    pub fifo_in: PathBuf,

    #[arg(long, default_value = "/tmp/agent-out")]
    pub fifo_out: PathBuf,

    #[arg(long, default_value = "/tmp/agent-daemon.pid")]
    pub pid_file: PathBuf,

    #[arg(long, default_value_t = 120)]
    pub turn_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub reset_timeout_secs: u64,

    #[arg(long, default_value_t = 2000)]
    pub startup_grace_ms: u64,

    #[arg(long, default_value_t = 16)]
    pub queue_depth: usize,

    #[arg(long, default_value_t = 300)]
    pub queue_timeout_secs: u64,

    /// Reject with 429 instead of queueing while the daemon is busy.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    #[arg(long, value_enum, default_value_t = TimeoutPolicy::ResetThenRestart)]
    pub timeout_policy: TimeoutPolicy,
}

impl DaemonArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            turn_timeout: Duration::from_secs(self.turn_timeout_secs),
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            queue_depth: self.queue_depth,
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            strict: self.strict,
            timeout_policy: self.timeout_policy,
            pid_file: Some(self.pid_file.clone()),
            kill_grace: DEFAULT_KILL_GRACE,
            ..SessionConfig::default()
        }
    }
}

#[derive(Debug, clap::Args, Clone)]
pub struct CallCommand {
    #[arg(short, long, default_value = "claude")]
    pub agent: BackendKind,

    #[arg(short, long)]
    pub model: Option<String>,

    /// Working directory for the agent.
    #[arg(short, long)]
    pub context: Option<PathBuf>,

    /// JSON schema for structured output.
    #[arg(short = 'j', long = "json-schema")]
    pub json_schema: Option<String>,

    /// Raw mode: send the prompt without the one-shot instructions.
    #[arg(short, long, default_value_t = false)]
    pub raw: bool,

    /// Only print the reply.
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,

    #[arg(long = "agent-command", value_parser = parse_agent_command)]
    pub agent_commands: Vec<(BackendKind, String)>,

    /// Read the prompt from a file instead of the arguments.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Prompt words; read from stdin when omitted.
    pub prompt: Vec<String>,
}

impl CallCommand {
    pub fn prompt(&self, stdin: impl Read, stdin_is_terminal: bool) -> anyhow::Result<String> {
        if let Some(path) = &self.file {
            return read_prompt_file(path);
        }
        if !self.prompt.is_empty() {
            return Ok(self.prompt.join(" "));
        }
        read_piped_prompt(stdin, stdin_is_terminal)
    }
}

#[derive(Debug, clap::Args, Clone)]
pub struct SessionCommand {
    #[arg(short, long, default_value = "claude")]
    pub agent: BackendKind,

    #[arg(short, long)]
    pub model: Option<String>,

    /// Working directory for the agent.
    #[arg(short, long)]
    pub context: Option<PathBuf>,

    /// Add a turn whose prompt is this file's contents. Repeatable.
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,

    /// Keep context between this run's turns instead of clearing after each.
    #[arg(long, default_value_t = false)]
    pub no_clear: bool,

    /// Send prompts without the one-shot instructions.
    #[arg(long, default_value_t = false)]
    pub raw_prompt: bool,

    /// Print every protocol message of each turn as a JSON line.
    #[arg(long, default_value_t = false)]
    pub raw: bool,

    #[arg(short = 'j', long = "json-schema")]
    pub json_schema: Option<String>,

    #[arg(short = 't', long = "timeout", default_value_t = 120)]
    pub timeout_secs: u64,

    #[arg(long = "agent-command", value_parser = parse_agent_command)]
    pub agent_commands: Vec<(BackendKind, String)>,

    /// One turn per argument; stdin is a single turn when none are given.
    pub prompts: Vec<String>,
}

impl SessionCommand {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn prompts(&self, stdin: impl Read, stdin_is_terminal: bool) -> anyhow::Result<Vec<String>> {
        let mut prompts = self
            .files
            .iter()
            .map(|path| read_prompt_file(path))
            .collect::<anyhow::Result<Vec<_>>>()?;
        prompts.extend(self.prompts.iter().cloned());
        if prompts.is_empty() {
            prompts.push(read_piped_prompt(stdin, stdin_is_terminal)?);
        }
        Ok(prompts)
    }
}

fn read_prompt_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt file {}", path.display()))
}

fn read_piped_prompt(mut stdin: impl Read, stdin_is_terminal: bool) -> anyhow::Result<String> {
    if stdin_is_terminal {
        bail!("no prompt provided");
    }
    let mut prompt = String::new();
    stdin
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    if prompt.trim().is_empty() {
        bail!("no prompt provided");
    }
    Ok(prompt)
}
