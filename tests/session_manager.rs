//! Session manager behaviour against in-process fake agents speaking the
//! streaming JSON protocol over in-memory pipes.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use agent_gateway::{
    backend::BackendKind,
    error::ErrorKind,
    session::{
        AgentLauncher, AskOptions, SessionChannels, SessionClient, SessionConfig, SessionManager,
        SessionState, TimeoutPolicy, TurnRequest,
    },
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    /// Remembers every prompt until `/clear` and answers with what it remembers.
    Memory,
    /// Reads input but never answers.
    Silent,
    /// Exits on the first prompt of the first launch, then behaves like `Memory`.
    CrashOnce,
    /// Answers only the first prompt, then goes quiet (the reset hangs).
    StallAfterFirst,
    /// Reports every prompt as failed but still honours `/clear`.
    Failing,
    /// Exits shortly after startup without being asked anything.
    ExitWhenIdle,
}

/// Launches one fake agent per call and records every line it receives.
struct ScriptedLauncher {
    behaviour: Behaviour,
    reply_delay: Duration,
    received: Arc<Mutex<Vec<String>>>,
    launches: AtomicUsize,
    max_launches: usize,
}

impl ScriptedLauncher {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Self::with_delay(behaviour, Duration::ZERO)
    }

    fn with_delay(behaviour: Behaviour, reply_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            reply_delay,
            received: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
            max_launches: usize::MAX,
        })
    }

    /// The first launch succeeds; every relaunch fails to spawn.
    fn refusing_relaunch(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            reply_delay: Duration::ZERO,
            received: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
            max_launches: 1,
        })
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self) -> agent_gateway::error::Result<SessionChannels> {
        let launch = self.launches.fetch_add(1, Ordering::SeqCst);
        if launch >= self.max_launches {
            return Err(agent_gateway::error::AgentError::spawn("agent binary vanished"));
        }
        let (inbound, agent_stdin) = tokio::io::duplex(64 * 1024);
        let (agent_stdout, outbound) = tokio::io::duplex(64 * 1024);
        let behaviour = match self.behaviour {
            Behaviour::CrashOnce if launch > 0 => Behaviour::Memory,
            other => other,
        };
        tokio::spawn(fake_agent(
            behaviour,
            self.reply_delay,
            agent_stdin,
            agent_stdout,
            Arc::clone(&self.received),
        ));
        Ok(SessionChannels {
            inbound: Box::new(inbound),
            outbound: Box::new(outbound),
            process: None,
        })
    }

    fn describe(&self) -> String {
        format!("scripted {:?}", self.behaviour)
    }
}

async fn emit(out: &mut DuplexStream, message: Value) {
    let mut line = message.to_string();
    line.push('\n');
    let _ = out.write_all(line.as_bytes()).await;
}

async fn fake_agent(
    behaviour: Behaviour,
    reply_delay: Duration,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    received: Arc<Mutex<Vec<String>>>,
) {
    emit(&mut stdout, json!({"type": "system", "subtype": "init"})).await;
    if behaviour == Behaviour::ExitWhenIdle {
        tokio::time::sleep(Duration::from_millis(50)).await;
        return;
    }
    let mut lines = BufReader::new(stdin).lines();
    let mut memory: Vec<String> = Vec::new();
    let mut answered = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        let message: Value = serde_json::from_str(&line).expect("manager sends json lines");
        assert_eq!(message["type"], "user");
        let content = message["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        received.lock().push(content.clone());

        match behaviour {
            Behaviour::Silent => continue,
            Behaviour::CrashOnce => return,
            Behaviour::StallAfterFirst if answered > 0 => continue,
            _ => {}
        }
        if !reply_delay.is_zero() {
            tokio::time::sleep(reply_delay).await;
        }
        if behaviour == Behaviour::Failing && content != "/clear" {
            emit(
                &mut stdout,
                json!({"type": "result", "subtype": "error_during_execution", "is_error": true, "result": "rate limited"}),
            )
            .await;
            continue;
        }

        let reply = if content == "/clear" {
            memory.clear();
            "Conversation cleared.".to_string()
        } else if let Some((_, wanted)) = content.split_once("respond with ") {
            memory.push(content.clone());
            wanted.to_string()
        } else {
            memory.push(content.clone());
            format!("I remember: {}", memory.join(" | "))
        };
        answered += 1;

        // Stream the reply in two deltas, then the full block and the result.
        let middle = reply
            .char_indices()
            .nth(reply.chars().count() / 2)
            .map_or(reply.len(), |(at, _)| at);
        let (head, tail) = reply.split_at(middle);
        for part in [head, tail] {
            emit(
                &mut stdout,
                json!({
                    "type": "stream_event",
                    "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": part}}
                }),
            )
            .await;
        }
        emit(
            &mut stdout,
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": reply}]}}),
        )
        .await;
        emit(&mut stdout, json!({"type": "result", "subtype": "success", "result": reply})).await;
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        turn_timeout: Duration::from_secs(5),
        reset_timeout: Duration::from_millis(500),
        startup_grace: Duration::from_millis(20),
        kill_grace: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

async fn start(launcher: &Arc<ScriptedLauncher>, config: SessionConfig) -> SessionManager {
    SessionManager::start(
        BackendKind::Claude,
        Arc::clone(launcher) as Arc<dyn AgentLauncher>,
        config,
    )
    .await
    .expect("session should start")
}

async fn wait_for_state(manager: &SessionManager, wanted: &[SessionState]) -> SessionState {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = manager.state();
        if wanted.contains(&state) || Instant::now() > deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn startup_reaches_ready() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;
    assert_eq!(manager.state(), SessionState::Ready);
    assert_eq!(manager.kind(), BackendKind::Claude);
    manager.shutdown().await;
    assert_eq!(manager.state(), SessionState::Stopped);
}

#[tokio::test]
async fn reply_text_prefers_result_and_is_reset_afterwards() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;

    let reply = manager.submit(TurnRequest::new("hello")).await.unwrap();
    assert_eq!(reply.text, "I remember: hello");
    assert!(reply.parsed_json.is_none());
    assert_eq!(reply.messages.last().unwrap()["type"], "result");
    assert_eq!(launcher.received(), vec!["hello", "/clear"]);
    assert_eq!(manager.state(), SessionState::Ready);
    manager.shutdown().await;
}

#[tokio::test]
async fn code_word_does_not_leak_across_turns() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;

    let first = manager
        .submit(TurnRequest::new("The code word is BANANA"))
        .await
        .unwrap();
    assert!(first.text.contains("BANANA"));

    let second = manager
        .submit(TurnRequest::new("What is the code word?"))
        .await
        .unwrap();
    assert!(!second.text.contains("BANANA"), "leaked: {}", second.text);
    manager.shutdown().await;
}

#[tokio::test]
async fn preserved_turns_share_context_until_final_reset() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;

    manager
        .submit(TurnRequest::new("The code word is BANANA").preserving_context())
        .await
        .unwrap();
    let follow_up = manager
        .submit(TurnRequest::new("What is the code word?"))
        .await
        .unwrap();
    assert!(follow_up.text.contains("BANANA"));

    let after_reset = manager
        .submit(TurnRequest::new("Anything to remember?"))
        .await
        .unwrap();
    assert!(!after_reset.text.contains("BANANA"));
    assert_eq!(
        launcher.received(),
        vec![
            "The code word is BANANA",
            "What is the code word?",
            "/clear",
            "Anything to remember?",
            "/clear",
        ]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_turns_are_strictly_serialized() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(5));
    let manager = start(&launcher, fast_config()).await;

    let turns: Vec<_> = (0..8)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .submit(TurnRequest::new(format!("prompt-{i}")))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for (i, turn) in turns.into_iter().enumerate() {
        let reply = turn.await.unwrap();
        // Each reply only ever sees its own prompt.
        assert_eq!(reply.text, format!("I remember: prompt-{i}"));
    }

    let received = launcher.received();
    assert_eq!(received.len(), 16);
    for pair in received.chunks(2) {
        assert!(pair[0].starts_with("prompt-"));
        assert_eq!(pair[1], "/clear");
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn structured_reply_is_extracted() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;
    let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});

    let reply = manager
        .submit(TurnRequest::new("respond with {\"n\":42}").with_schema(schema))
        .await
        .unwrap();
    assert_eq!(reply.parsed_json, Some(json!({"n": 42})));
    manager.shutdown().await;
}

#[tokio::test]
async fn client_wraps_prompt_and_embeds_schema() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let client = SessionClient::new(start(&launcher, fast_config()).await);

    // The echoed prompt may or may not contain a usable object; only the
    // text sent to the agent matters here.
    let _ = client
        .ask(
            "summarise",
            AskOptions {
                schema: Some(json!({"type": "object"})),
                ..AskOptions::default()
            },
        )
        .await;
    let sent = &launcher.received()[0];
    assert!(sent.starts_with("summarise\n\n---\nIMPORTANT"));
    assert!(sent.contains("JSON Schema"));

    client
        .ask(
            "exact words",
            AskOptions {
                raw_prompt: true,
                ..AskOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(launcher.received().contains(&"exact words".to_string()));
    client.manager().shutdown().await;
}

#[tokio::test]
async fn silent_agent_times_out_and_recovers_by_restart() {
    let launcher = ScriptedLauncher::new(Behaviour::Silent);
    let manager = start(&launcher, fast_config()).await;

    let started = Instant::now();
    let err = manager
        .submit(TurnRequest::new("anyone there?").with_timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));

    let state = wait_for_state(&manager, &[SessionState::Ready, SessionState::Degraded]).await;
    assert_eq!(state, SessionState::Ready);
    assert_eq!(launcher.launches(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn restart_policy_skips_the_reset() {
    let launcher = ScriptedLauncher::new(Behaviour::Silent);
    let config = SessionConfig {
        timeout_policy: TimeoutPolicy::Restart,
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let err = manager
        .submit(TurnRequest::new("hello?").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    wait_for_state(&manager, &[SessionState::Ready]).await;
    assert_eq!(launcher.received(), vec!["hello?"]);
    assert_eq!(launcher.launches(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn hung_reset_forces_restart() {
    let launcher = ScriptedLauncher::new(Behaviour::StallAfterFirst);
    let manager = start(&launcher, fast_config()).await;

    let reply = manager.submit(TurnRequest::new("first")).await.unwrap();
    assert_eq!(reply.text, "I remember: first");
    assert_eq!(manager.state(), SessionState::Ready);
    assert_eq!(launcher.launches(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn crash_degrades_and_refuses_without_writing() {
    let launcher = ScriptedLauncher::new(Behaviour::CrashOnce);
    let manager = start(&launcher, fast_config()).await;

    let err = manager.submit(TurnRequest::new("boom")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionBroken);
    assert_eq!(manager.state(), SessionState::Degraded);
    assert_eq!(launcher.received(), vec!["boom"]);

    let err = manager.submit(TurnRequest::new("again")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionBroken);
    assert_eq!(launcher.received(), vec!["boom"]);

    manager.restart().await.unwrap();
    assert_eq!(manager.state(), SessionState::Ready);
    let reply = manager.submit(TurnRequest::new("after restart")).await.unwrap();
    assert_eq!(reply.text, "I remember: after restart");
    manager.shutdown().await;
}

#[tokio::test]
async fn agent_reported_error_fails_turn_but_keeps_session() {
    let launcher = ScriptedLauncher::new(Behaviour::Failing);
    let manager = start(&launcher, fast_config()).await;

    let err = manager.submit(TurnRequest::new("do work")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AgentFailed);
    assert_eq!(err.message, "rate limited");
    assert_eq!(manager.state(), SessionState::Ready);
    assert_eq!(launcher.received(), vec!["do work", "/clear"]);
    assert_eq!(launcher.launches(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn strict_mode_rejects_while_busy() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(200));
    let config = SessionConfig {
        strict: true,
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(TurnRequest::new("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = manager.submit(TurnRequest::new("impatient")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    assert!(err.is_retryable());

    first.await.unwrap().unwrap();
    manager.submit(TurnRequest::new("now free")).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn queue_wait_is_bounded() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(150));
    let config = SessionConfig {
        queue_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(TurnRequest::new("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued_at = Instant::now();
    let err = manager.submit(TurnRequest::new("queued")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    // The in-flight turn still needs ~280ms; the queued caller gives up on time.
    assert!(
        queued_at.elapsed() < Duration::from_millis(200),
        "waited {:?}",
        queued_at.elapsed()
    );
    first.await.unwrap().unwrap();
    assert!(!launcher.received().contains(&"queued".to_string()));
    assert_eq!(launcher.received(), vec!["slow", "/clear"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn late_reply_inside_reset_window_is_discarded() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(300));
    let config = SessionConfig {
        reset_timeout: Duration::from_secs(2),
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let err = manager
        .submit(TurnRequest::new("respond with reply-1").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    let reply = manager
        .submit(TurnRequest::new("respond with reply-2"))
        .await
        .unwrap();
    assert_eq!(reply.text, "reply-2");
    assert_eq!(launcher.launches(), 1);
    assert_eq!(
        launcher.received(),
        vec!["respond with reply-1", "/clear", "respond with reply-2", "/clear"]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_restart_after_timeout_degrades() {
    let launcher = ScriptedLauncher::refusing_relaunch(Behaviour::Silent);
    let config = SessionConfig {
        timeout_policy: TimeoutPolicy::Restart,
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let err = manager
        .submit(TurnRequest::new("hello?").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(
        wait_for_state(&manager, &[SessionState::Degraded]).await,
        SessionState::Degraded
    );

    let err = manager.submit(TurnRequest::new("again")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionBroken);
    assert_eq!(launcher.received(), vec!["hello?"]);
    assert!(manager.restart().await.is_err());
    manager.shutdown().await;
}

#[tokio::test]
async fn agent_exit_while_idle_degrades() {
    let launcher = ScriptedLauncher::new(Behaviour::ExitWhenIdle);
    let manager = start(&launcher, fast_config()).await;

    assert_eq!(
        wait_for_state(&manager, &[SessionState::Degraded]).await,
        SessionState::Degraded
    );
    let err = manager.submit(TurnRequest::new("anyone?")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionBroken);
    assert!(launcher.received().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn full_queue_is_busy() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(150));
    let config = SessionConfig {
        queue_depth: 1,
        ..fast_config()
    };
    let manager = start(&launcher, config).await;

    let spawn_turn = |prompt: &'static str| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(TurnRequest::new(prompt)).await })
    };
    let in_flight = spawn_turn("in flight");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = spawn_turn("queued");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager.submit(TurnRequest::new("overflow")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);
    in_flight.await.unwrap().unwrap();
    queued.await.unwrap().unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn abandoned_turn_still_completes_and_resets() {
    let launcher = ScriptedLauncher::with_delay(Behaviour::Memory, Duration::from_millis(100));
    let manager = start(&launcher, fast_config()).await;

    let abandoned = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.submit(TurnRequest::new("The code word is BANANA")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    abandoned.abort();

    let next = manager
        .submit(TurnRequest::new("What is the code word?"))
        .await
        .unwrap();
    assert!(!next.text.contains("BANANA"));
    assert_eq!(
        launcher.received(),
        vec![
            "The code word is BANANA",
            "/clear",
            "What is the code word?",
            "/clear",
        ]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_refuses_new_turns() {
    let launcher = ScriptedLauncher::new(Behaviour::Memory);
    let manager = start(&launcher, fast_config()).await;
    manager.shutdown().await;
    manager.shutdown().await;
    let err = manager.submit(TurnRequest::new("late")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionBroken);
    assert!(launcher.received().is_empty());
}
