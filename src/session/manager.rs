//! Daemon session manager.
//!
//! One actor task owns the agent process and both of its channels. Callers
//! submit turns through a bounded queue and wait on a oneshot reply, so turns
//! are served strictly in arrival order and only the actor ever writes to or
//! reads from the agent.

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::Child,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::{timeout, timeout_at, Instant},
};

use super::{
    protocol::{self, ReplyCollector, RESET_COMMAND},
    transport::{AgentLauncher, Inbound, Outbound},
};
use crate::{
    backend::BackendKind,
    error::{AgentError, Result},
    extract::extract_structured,
    invoker::{terminate_child, DEFAULT_KILL_GRACE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    /// The agent died or stopped answering; turns are refused until
    /// [`SessionManager::restart`].
    Degraded,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a session whose turn timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TimeoutPolicy {
    /// Send the reset and wait briefly for it; restart if it never finishes.
    #[default]
    ResetThenRestart,
    /// Always restart the agent.
    Restart,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub turn_timeout: Duration,
    pub reset_timeout: Duration,
    /// How long startup waits for the agent's first message.
    pub startup_grace: Duration,
    pub queue_depth: usize,
    /// Longest a turn may wait in the queue before it is rejected as busy.
    pub queue_timeout: Duration,
    /// Reject instead of queueing while another turn is outstanding.
    pub strict: bool,
    pub timeout_policy: TimeoutPolicy,
    pub reset_command: String,
    /// Liveness marker holding the agent pid.
    pub pid_file: Option<PathBuf>,
    pub kill_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_secs(2),
            queue_depth: 16,
            queue_timeout: Duration::from_secs(300),
            strict: false,
            timeout_policy: TimeoutPolicy::default(),
            reset_command: RESET_COMMAND.to_string(),
            pid_file: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub prompt: String,
    pub schema: Option<Value>,
    pub preserve_context: bool,
    /// Overrides [`SessionConfig::turn_timeout`].
    pub timeout: Option<Duration>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn preserving_context(mut self) -> Self {
        self.preserve_context = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub parsed_json: Option<Value>,
    /// Protocol messages of the turn in arrival order.
    pub messages: Vec<Value>,
}

enum Command {
    Turn {
        request: TurnRequest,
        /// Fired when the actor picks the turn up.
        started: oneshot::Sender<()>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Restart {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct Shared {
    status: Mutex<Status>,
    /// Turns queued or in flight.
    outstanding: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: SessionState,
    pid: Option<u32>,
}

/// Handle to a running session. Cheap to clone; all clones talk to the same
/// actor.
#[derive(Debug, Clone)]
pub struct SessionManager {
    kind: BackendKind,
    strict: bool,
    queue_depth: usize,
    queue_timeout: Duration,
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Launch the agent and wait until it is ready for the first turn.
    pub async fn start(
        kind: BackendKind,
        launcher: Arc<dyn AgentLauncher>,
        config: SessionConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: SessionState::Starting,
                pid: None,
            }),
            outstanding: AtomicUsize::new(0),
        });
        let queue_depth = config.queue_depth.max(1);
        let queue_timeout = config.queue_timeout;
        let strict = config.strict;

        tracing::info!(
            target = "agent_gateway::session",
            agent = %kind,
            launcher = %launcher.describe(),
            "starting agent session"
        );
        let mut actor = Actor {
            launcher,
            config,
            shared: Arc::clone(&shared),
            session: None,
        };
        actor.open().await?;

        let (tx, rx) = mpsc::channel(queue_depth);
        tokio::spawn(actor.run(rx));

        Ok(Self {
            kind,
            strict,
            queue_depth,
            queue_timeout,
            tx,
            shared,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.status.lock().pid
    }

    /// Run one turn. Waits in FIFO order behind earlier turns, for at most
    /// `queue_timeout` before the turn is picked up.
    pub async fn submit(&self, request: TurnRequest) -> Result<Reply> {
        match self.state() {
            SessionState::Degraded => {
                return Err(AgentError::session_broken(
                    "agent session is degraded; restart required",
                ))
            }
            SessionState::Stopped => {
                return Err(AgentError::session_broken("agent session is stopped"))
            }
            _ => {}
        }

        if self.strict {
            if self
                .shared
                .outstanding
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(AgentError::busy("agent session is busy"));
            }
        } else {
            self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        }

        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Turn {
            request,
            started: started_tx,
            reply: reply_tx,
        };
        if let Err(error) = self.tx.try_send(command) {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(match error {
                TrySendError::Full(_) => AgentError::busy(format!(
                    "request queue is full ({} waiting)",
                    self.queue_depth
                )),
                TrySendError::Closed(_) => AgentError::session_broken("agent session is stopped"),
            });
        }

        // A dropped `started` means the actor answered without running the
        // turn; the reply carries why.
        if timeout(self.queue_timeout, started_rx).await.is_err() {
            return Err(AgentError::busy(format!(
                "request waited {}s in queue",
                self.queue_timeout.as_secs_f32()
            )));
        }

        reply_rx.await.unwrap_or_else(|_| {
            Err(AgentError::session_broken(
                "agent session stopped before replying",
            ))
        })
    }

    /// Tear down the current agent (if any) and launch a fresh one.
    pub async fn restart(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Restart { reply: reply_tx })
            .await
            .map_err(|_| AgentError::session_broken("agent session is stopped"))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(AgentError::session_broken("agent session is stopped")))
    }

    /// Stop the agent and remove coordination artifacts. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

enum Failure {
    TimedOut,
    Broken(String),
}

/// The live agent: its process and both channel ends.
struct Session {
    inbound: Inbound,
    lines: Lines<BufReader<Outbound>>,
    process: Option<Child>,
    /// Replies written for but not yet terminated.
    owed: usize,
}

impl Session {
    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    fn has_exited(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn await_startup(&mut self, grace: Duration) -> Result<()> {
        match timeout(grace, self.lines.next_line()).await {
            // Agents in stream-json mode often stay quiet until the first input.
            Err(_) => {}
            Ok(Ok(Some(line))) => {
                tracing::debug!(
                    target = "agent_gateway::session",
                    first_line = %line,
                    "agent produced startup output"
                );
            }
            Ok(Ok(None)) => {
                return Err(AgentError::spawn("agent closed its output during startup"));
            }
            Ok(Err(error)) => {
                return Err(AgentError::spawn(format!(
                    "failed reading agent output during startup: {error}"
                )));
            }
        }
        if self.has_exited() {
            return Err(AgentError::spawn("agent exited during startup"));
        }
        Ok(())
    }

    /// Resolves once the idle agent is gone. Output that arrives meanwhile
    /// belongs to no turn and is dropped.
    async fn idle_exit(&mut self) -> String {
        let Self { lines, process, .. } = self;
        loop {
            tokio::select! {
                status = wait_for_exit(process.as_mut()) => {
                    return format!("agent exited while idle ({status})");
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        tracing::trace!(target = "agent_gateway::session", line = %line, "dropping idle output");
                    }
                    Ok(None) => return "agent closed its output while idle".to_string(),
                    Err(error) => return format!("read from idle agent failed: {error}"),
                },
            }
        }
    }

    /// Discard output that is already buffered but belongs to no turn.
    async fn drain_stale(&mut self) {
        let mut dropped = 0usize;
        while let Ok(Ok(Some(_))) = timeout(Duration::ZERO, self.lines.next_line()).await {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(
                target = "agent_gateway::session",
                dropped,
                "drained stale agent output"
            );
        }
    }

    async fn send(&mut self, content: &str) -> std::result::Result<(), Failure> {
        let mut line = protocol::encode_user_message(content);
        line.push('\n');
        self.inbound
            .write_all(line.as_bytes())
            .await
            .map_err(|error| Failure::Broken(format!("write to agent failed: {error}")))?;
        self.inbound
            .flush()
            .await
            .map_err(|error| Failure::Broken(format!("flush to agent failed: {error}")))?;
        self.owed += 1;
        Ok(())
    }

    /// Read until every owed reply has terminated. Only the newest reply's
    /// messages reach `collector`; earlier ones are stale.
    async fn collect(
        &mut self,
        collector: &mut ReplyCollector,
        deadline: Instant,
    ) -> std::result::Result<(), Failure> {
        while self.owed > 0 {
            let line = match timeout_at(deadline, self.lines.next_line()).await {
                Err(_) => return Err(Failure::TimedOut),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(Failure::Broken("agent closed its output".into())),
                Ok(Err(error)) => {
                    return Err(Failure::Broken(format!("read from agent failed: {error}")))
                }
            };
            let Some(message) = protocol::parse_line(&line) else {
                tracing::trace!(target = "agent_gateway::session", line = %line, "skipping non-json line");
                continue;
            };
            if self.owed > 1 {
                if protocol::is_terminal(&message) {
                    self.owed -= 1;
                }
                continue;
            }
            if collector.push(message) {
                self.owed = 0;
            }
        }
        Ok(())
    }

    async fn close(mut self, grace: Duration) {
        let _ = timeout(grace, self.inbound.shutdown()).await;
        drop(self.inbound);
        if let Some(mut child) = self.process.take() {
            terminate_child(&mut child, grace).await;
        }
    }
}

struct Actor {
    launcher: Arc<dyn AgentLauncher>,
    config: SessionConfig,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let event = tokio::select! {
                command = rx.recv() => Ok(command),
                reason = watch_idle(self.session.as_mut()) => Err(reason),
            };
            let command = match event {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(reason) => {
                    self.degrade(&reason).await;
                    continue;
                }
            };
            match command {
                Command::Turn {
                    request,
                    started,
                    reply,
                } => {
                    self.turn(request, started, reply).await;
                }
                Command::Restart { reply } => {
                    let _ = reply.send(self.restart().await);
                }
                Command::Shutdown { reply } => {
                    self.stop().await;
                    rx.close();
                    while let Some(pending) = rx.recv().await {
                        reject(pending);
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // Every handle was dropped.
        self.stop().await;
    }

    async fn turn(
        &mut self,
        request: TurnRequest,
        picked_up: oneshot::Sender<()>,
        reply: oneshot::Sender<Result<Reply>>,
    ) {
        if reply.is_closed() || picked_up.send(()).is_err() {
            tracing::debug!(
                target = "agent_gateway::session",
                "caller left before its turn started; skipping"
            );
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match self.session.as_mut() {
            Some(session) => session.drain_stale().await,
            None => {
                self.answer(
                    reply,
                    Err(AgentError::session_broken(
                        "agent session is degraded; restart required",
                    )),
                );
                return;
            }
        }

        self.set_state(SessionState::Busy);
        let started = Instant::now();
        let deadline = started + request.timeout.unwrap_or(self.config.turn_timeout);
        tracing::debug!(
            target = "agent_gateway::session",
            prompt_chars = request.prompt.len(),
            preserve_context = request.preserve_context,
            "turn started"
        );
        let (collector, outcome) = self.exchange(&request.prompt, deadline).await;

        match outcome {
            Ok(()) => {
                let result = reduce(collector, request.schema.as_ref());
                if !request.preserve_context {
                    self.reset().await;
                }
                if self.session.is_some() {
                    self.set_state(SessionState::Ready);
                }
                tracing::info!(
                    target = "agent_gateway::session",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "turn complete"
                );
                self.answer(reply, result);
            }
            Err(Failure::TimedOut) => {
                let budget = deadline.saturating_duration_since(started);
                tracing::warn!(
                    target = "agent_gateway::session",
                    timeout_ms = budget.as_millis() as u64,
                    policy = ?self.config.timeout_policy,
                    "turn timed out"
                );
                self.answer(
                    reply,
                    Err(AgentError::timeout(format!(
                        "agent did not finish within {}s",
                        budget.as_secs_f32()
                    ))
                    .with_raw_text(collector.partial_text())),
                );
                self.recover_from_timeout().await;
            }
            Err(Failure::Broken(reason)) => {
                self.degrade(&reason).await;
                self.answer(reply, Err(AgentError::session_broken(reason)));
            }
        }
    }

    /// Frees the caller's outstanding slot before it sees the result.
    fn answer(&self, reply: oneshot::Sender<Result<Reply>>, result: Result<Reply>) {
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        let _ = reply.send(result);
    }

    async fn exchange(
        &mut self,
        content: &str,
        deadline: Instant,
    ) -> (ReplyCollector, std::result::Result<(), Failure>) {
        let mut collector = ReplyCollector::new();
        let Some(session) = self.session.as_mut() else {
            return (collector, Err(Failure::Broken("no agent session".into())));
        };
        if session.has_exited() {
            return (collector, Err(Failure::Broken("agent process exited".into())));
        }
        let outcome = match session.send(content).await {
            Ok(()) => session.collect(&mut collector, deadline).await,
            Err(failure) => Err(failure),
        };
        (collector, outcome)
    }

    async fn reset(&mut self) {
        let command = self.config.reset_command.clone();
        let deadline = Instant::now() + self.config.reset_timeout;
        match self.exchange(&command, deadline).await.1 {
            Ok(()) => {
                tracing::debug!(target = "agent_gateway::session", "context reset");
            }
            Err(Failure::TimedOut) => {
                tracing::warn!(
                    target = "agent_gateway::session",
                    "context reset did not finish; restarting agent"
                );
                self.force_restart().await;
            }
            Err(Failure::Broken(reason)) => self.degrade(&reason).await,
        }
    }

    async fn recover_from_timeout(&mut self) {
        match self.config.timeout_policy {
            TimeoutPolicy::ResetThenRestart => {
                // The reset queues behind the unfinished reply, so both must
                // terminate within the reset window.
                let command = self.config.reset_command.clone();
                let deadline = Instant::now() + self.config.reset_timeout;
                match self.exchange(&command, deadline).await.1 {
                    Ok(()) => {
                        tracing::info!(
                            target = "agent_gateway::session",
                            "agent recovered after timeout"
                        );
                        self.set_state(SessionState::Ready);
                    }
                    Err(Failure::TimedOut) => self.force_restart().await,
                    Err(Failure::Broken(reason)) => self.degrade(&reason).await,
                }
            }
            TimeoutPolicy::Restart => self.force_restart().await,
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.set_status(SessionState::Starting, None);
        let channels = match self.launcher.launch() {
            Ok(channels) => channels,
            Err(error) => {
                self.launcher.cleanup();
                self.set_status(SessionState::Degraded, None);
                return Err(error);
            }
        };
        let mut session = Session {
            inbound: channels.inbound,
            lines: BufReader::new(channels.outbound).lines(),
            process: channels.process,
            owed: 0,
        };
        let pid = session.pid();

        if let Err(error) = session.await_startup(self.config.startup_grace).await {
            tracing::error!(
                target = "agent_gateway::session",
                pid = ?pid,
                error = %error,
                "agent failed to start"
            );
            session.close(self.config.kill_grace).await;
            self.launcher.cleanup();
            self.set_status(SessionState::Degraded, None);
            return Err(error);
        }

        if let (Some(path), Some(pid)) = (&self.config.pid_file, pid) {
            if let Err(error) = std::fs::write(path, pid.to_string()) {
                tracing::warn!(
                    target = "agent_gateway::session",
                    path = %path.display(),
                    error = %error,
                    "failed to write pid file"
                );
            }
        }
        self.session = Some(session);
        self.set_status(SessionState::Ready, pid);
        tracing::info!(target = "agent_gateway::session", pid = ?pid, "agent session ready");
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        tracing::info!(target = "agent_gateway::session", "restarting agent session");
        self.teardown().await;
        self.open().await
    }

    async fn force_restart(&mut self) {
        if let Err(error) = self.restart().await {
            tracing::error!(
                target = "agent_gateway::session",
                error = %error,
                "restart failed; session degraded"
            );
        }
    }

    async fn degrade(&mut self, reason: &str) {
        tracing::warn!(
            target = "agent_gateway::session",
            reason,
            "agent session broken"
        );
        self.teardown().await;
        self.set_status(SessionState::Degraded, None);
    }

    async fn stop(&mut self) {
        self.teardown().await;
        self.set_status(SessionState::Stopped, None);
        tracing::info!(target = "agent_gateway::session", "agent session stopped");
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close(self.config.kill_grace).await;
        }
        self.launcher.cleanup();
        if let Some(path) = &self.config.pid_file {
            if let Err(error) = std::fs::remove_file(path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        target = "agent_gateway::session",
                        path = %path.display(),
                        error = %error,
                        "failed to remove pid file"
                    );
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.shared.status.lock().state = state;
    }

    fn set_status(&self, state: SessionState, pid: Option<u32>) {
        *self.shared.status.lock() = Status { state, pid };
    }
}

async fn watch_idle(session: Option<&mut Session>) -> String {
    match session {
        Some(session) => session.idle_exit().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_exit(child: Option<&mut Child>) -> String {
    match child {
        Some(child) => match child.wait().await {
            Ok(status) => status.to_string(),
            Err(error) => error.to_string(),
        },
        None => std::future::pending().await,
    }
}

fn reduce(collector: ReplyCollector, schema: Option<&Value>) -> Result<Reply> {
    let (text, messages) = collector.finish()?;
    let parsed_json = match schema {
        Some(schema) => Some(extract_structured(&text, schema)?),
        None => None,
    };
    Ok(Reply {
        text,
        parsed_json,
        messages,
    })
}

fn reject(command: Command) {
    let error = || AgentError::session_broken("agent session is stopped");
    match command {
        Command::Turn { reply, .. } => {
            let _ = reply.send(Err(error()));
        }
        Command::Restart { reply } => {
            let _ = reply.send(Err(error()));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
