use std::{io::IsTerminal, sync::Arc, time::Duration};

use agent_gateway::{
    api,
    backend::{BackendKind, BackendTable},
    config::{CallCommand, Cli, Commands, DaemonArgs, ServeCommand, SessionCommand, TransportKind},
    error::ErrorKind,
    gateway::Gateway,
    models::ModelTable,
    oneshot::{OneShotAdapter, OneShotRequest},
    session::{
        AgentCommand, AgentLauncher, AskOptions, Reply, SessionClient, SessionConfig,
        SessionManager, StdioLauncher,
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve(cmd) => run_serve(cmd).await,
        Commands::Call(cmd) => run_call(cmd).await,
        Commands::Session(cmd) => run_session(cmd).await,
    }
}

fn init_tracing(default_level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_schema(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(serde_json::from_str::<Value>)
        .transpose()
        .context("--json-schema is not valid JSON")
}

fn ensure_dir(dir: Option<&std::path::Path>) -> Result<()> {
    if let Some(dir) = dir {
        if !dir.is_dir() {
            anyhow::bail!("context directory does not exist: {}", dir.display());
        }
    }
    Ok(())
}

fn backend_table(overrides: &[(BackendKind, String)]) -> Result<Arc<BackendTable>> {
    let table = BackendTable::builtin()
        .with_overrides(overrides)
        .context("invalid --agent-command")?;
    Ok(Arc::new(table))
}

async fn run_serve(cmd: ServeCommand) -> Result<()> {
    let backends = backend_table(&cmd.agent_commands)?;
    let models = ModelTable::builtin(&backends);
    let oneshot = OneShotAdapter::new(Arc::clone(&backends), cmd.one_shot_timeout());
    let mut gateway = Gateway::new(models, oneshot).with_force_agent(cmd.force_agent());

    let daemon = match cmd.daemon.daemon_agent {
        Some(kind) => Some(start_daemon(kind, &backends, &cmd.daemon).await?),
        None => None,
    };
    if let Some(manager) = &daemon {
        gateway = gateway.with_daemon(SessionClient::new(manager.clone()));
    }

    let model_ids: Vec<String> = gateway
        .models()
        .listed()
        .map(|descriptor| descriptor.id.clone())
        .collect();
    let router = api::router(Arc::new(gateway), cmd.api_key.clone());
    let addr = format!("{}:{}", cmd.host, cmd.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        addr = %addr,
        models = %model_ids.join(", "),
        daemon = ?cmd.daemon.daemon_agent,
        auth = cmd.api_key.as_deref().is_some_and(|key| !key.trim().is_empty()),
        "agent gateway listening"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error");

    if let Some(manager) = daemon {
        manager.shutdown().await;
    }
    served
}

async fn start_daemon(
    kind: BackendKind,
    backends: &BackendTable,
    args: &DaemonArgs,
) -> Result<SessionManager> {
    let invocation = backends
        .get(kind)
        .session(args.daemon_model.as_deref())
        .with_context(|| format!("agent '{kind}' has no persistent session mode"))?;
    let command =
        AgentCommand::from_invocation(invocation).with_working_dir(args.daemon_cwd.clone());

    let launcher: Arc<dyn AgentLauncher> = match args.transport {
        #[cfg(unix)]
        TransportKind::Fifo => Arc::new(agent_gateway::session::FifoLauncher::new(
            command,
            &args.fifo_in,
            &args.fifo_out,
        )),
        #[cfg(not(unix))]
        TransportKind::Fifo => anyhow::bail!("the fifo transport requires a unix platform"),
        TransportKind::Stdio => Arc::new(StdioLauncher::new(command)),
    };

    SessionManager::start(kind, launcher, args.session_config())
        .await
        .with_context(|| format!("failed to start {kind} daemon session"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_call(cmd: CallCommand) -> Result<()> {
    let backends = backend_table(&cmd.agent_commands)?;
    let schema = parse_schema(cmd.json_schema.as_deref())?;
    ensure_dir(cmd.context.as_deref())?;

    let stdin = std::io::stdin();
    let prompt = cmd.prompt(stdin.lock(), stdin.is_terminal())?;
    if !cmd.quiet {
        eprintln!(
            "[agent-gateway] calling {}{}",
            cmd.agent,
            cmd.model
                .as_deref()
                .map(|model| format!(" (model {model})"))
                .unwrap_or_default()
        );
    }

    let adapter = OneShotAdapter::new(backends, Duration::from_secs(cmd.timeout_secs));
    let result = adapter
        .run(OneShotRequest {
            kind: cmd.agent,
            prompt: &prompt,
            schema: schema.as_ref(),
            context_dir: cmd.context.as_deref(),
            model: cmd.model.as_deref(),
            raw: cmd.raw,
        })
        .await;

    match result {
        Ok(output) => {
            match output.parsed_json {
                Some(parsed) => println!("{}", serde_json::to_string_pretty(&parsed)?),
                None => println!("{}", output.text),
            }
            Ok(())
        }
        Err(error) if error.kind == ErrorKind::SchemaExtractionFailed => {
            if !cmd.quiet {
                eprintln!("[agent-gateway] {}; printing raw reply", error.message);
            }
            println!("{}", error.raw_text.unwrap_or_default());
            Ok(())
        }
        Err(error) => Err(error).with_context(|| format!("{} call failed", cmd.agent)),
    }
}

async fn run_session(cmd: SessionCommand) -> Result<()> {
    let backends = backend_table(&cmd.agent_commands)?;
    let schema = parse_schema(cmd.json_schema.as_deref())?;
    ensure_dir(cmd.context.as_deref())?;
    let stdin = std::io::stdin();
    let prompts = cmd.prompts(stdin.lock(), stdin.is_terminal())?;

    let invocation = backends
        .get(cmd.agent)
        .session(cmd.model.as_deref())
        .with_context(|| format!("agent '{}' has no persistent session mode", cmd.agent))?;
    let command = AgentCommand::from_invocation(invocation).with_working_dir(cmd.context.clone());
    let config = SessionConfig {
        turn_timeout: cmd.turn_timeout(),
        ..SessionConfig::default()
    };
    let manager = SessionManager::start(cmd.agent, Arc::new(StdioLauncher::new(command)), config)
        .await
        .with_context(|| format!("failed to start {} session", cmd.agent))?;
    let client = SessionClient::new(manager.clone());

    let last = prompts.len().saturating_sub(1);
    let mut outcome = Ok(());
    for (index, prompt) in prompts.iter().enumerate() {
        let options = AskOptions {
            preserve_context: cmd.no_clear && index < last,
            raw_prompt: cmd.raw_prompt,
            timeout: None,
            schema: schema.clone(),
        };
        match client.ask(prompt, options).await {
            Ok(reply) => print_reply(&reply, cmd.raw)?,
            Err(error) if error.kind == ErrorKind::SchemaExtractionFailed => {
                eprintln!("[agent-gateway] {}; printing raw reply", error.message);
                println!("{}", error.raw_text.unwrap_or_default());
            }
            Err(error) => {
                outcome = Err(error).with_context(|| format!("turn {} failed", index + 1));
                break;
            }
        }
    }

    manager.shutdown().await;
    outcome
}

fn print_reply(reply: &Reply, raw: bool) -> Result<()> {
    if raw {
        for message in &reply.messages {
            println!("{message}");
        }
        return Ok(());
    }
    match &reply.parsed_json {
        Some(parsed) => println!("{}", serde_json::to_string_pretty(parsed)?),
        None => println!("{}", reply.text),
    }
    Ok(())
}
