//! Maps one chat-completion request onto either the one-shot adapter or the
//! daemon session, and back.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    backend::BackendKind,
    error::{AgentError, ErrorKind, Result},
    models::ModelTable,
    oneshot::{OneShotAdapter, OneShotRequest},
    session::{AskOptions, SessionClient},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    /// A string, or an array of `{"type":"text","text":...}` parts.
    #[serde(default)]
    pub content: Value,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
        }
    }
}

/// Text of a message's content. Array parts are joined by newlines.
pub fn extract_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(_) if part.get("type").and_then(Value::as_str) == Some("text") => {
                    Some(
                        part.get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    )
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten a chat transcript into one prompt. Unknown roles are dropped.
pub fn messages_to_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| {
            let content = extract_content(&message.content);
            match message.role.as_str() {
                "system" => Some(format!("[System]: {content}")),
                "user" => Some(content),
                "assistant" => Some(format!("[Previous response]: {content}")),
                _ => None,
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    /// Rough word-count estimate; the agents do not report token usage.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.split_whitespace().count() / 2;
        let completion_tokens = completion.split_whitespace().count();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub schema: Option<Value>,
    pub working_dir: Option<PathBuf>,
    pub preserve_context: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    OneShot,
    Daemon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: BackendKind,
    pub model: Option<String>,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub text: String,
    pub parsed_json: Option<Value>,
    /// A schema was requested but the reply held no conforming object;
    /// `text` is the raw reply.
    pub schema_extraction_failed: bool,
    pub usage: Usage,
    pub kind: BackendKind,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone)]
pub struct Gateway {
    models: ModelTable,
    oneshot: OneShotAdapter,
    daemon: Option<SessionClient>,
    force_agent: Option<BackendKind>,
}

impl Gateway {
    pub fn new(models: ModelTable, oneshot: OneShotAdapter) -> Self {
        Self {
            models,
            oneshot,
            daemon: None,
            force_agent: None,
        }
    }

    pub fn with_daemon(mut self, daemon: SessionClient) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_force_agent(mut self, force_agent: Option<BackendKind>) -> Self {
        self.force_agent = force_agent;
        self
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn daemon(&self) -> Option<&SessionClient> {
        self.daemon.as_ref()
    }

    /// Decide which agent serves `model` and how.
    ///
    /// The daemon's working directory and model are fixed when it starts, so
    /// requests that need either changed fall back to one-shot.
    pub fn route(&self, model: &str, working_dir_requested: bool) -> Result<Route> {
        let descriptor = self
            .models
            .resolve(model)
            .ok_or_else(|| AgentError::invalid_request(format!("Unknown model: {model}")))?;
        let (kind, model) = match self.force_agent {
            Some(kind) => (kind, None),
            None => (descriptor.kind, descriptor.model.clone()),
        };
        let daemon_eligible = self
            .daemon
            .as_ref()
            .is_some_and(|daemon| daemon.kind() == kind)
            && model.is_none()
            && !working_dir_requested;
        Ok(Route {
            kind,
            model,
            mode: if daemon_eligible {
                ExecutionMode::Daemon
            } else {
                ExecutionMode::OneShot
            },
        })
    }

    pub async fn complete_chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        if request.messages.is_empty() {
            return Err(AgentError::invalid_request("messages field required"));
        }
        let route = self.route(&request.model, request.working_dir.is_some())?;
        let prompt = messages_to_prompt(&request.messages);

        tracing::debug!(
            target = "agent_gateway::gateway",
            model = %request.model,
            agent = %route.kind,
            mode = ?route.mode,
            "routing chat completion"
        );

        let result = match (route.mode, self.daemon.as_ref()) {
            (ExecutionMode::Daemon, Some(daemon)) => daemon
                .ask(
                    &prompt,
                    AskOptions {
                        preserve_context: request.preserve_context,
                        schema: request.schema.clone(),
                        ..AskOptions::default()
                    },
                )
                .await
                .map(|reply| (reply.text, reply.parsed_json)),
            _ => {
                if request.preserve_context {
                    tracing::debug!(
                        target = "agent_gateway::gateway",
                        "preserve_context has no effect for one-shot calls"
                    );
                }
                self.oneshot
                    .run(OneShotRequest {
                        kind: route.kind,
                        prompt: &prompt,
                        schema: request.schema.as_ref(),
                        context_dir: request.working_dir.as_deref(),
                        model: route.model.as_deref(),
                        raw: false,
                    })
                    .await
                    .map(|output| (output.text, output.parsed_json))
            }
        };

        let (text, parsed_json, schema_extraction_failed) = match result {
            Ok((text, parsed_json)) => (text, parsed_json, false),
            Err(error) if error.kind == ErrorKind::SchemaExtractionFailed => {
                tracing::warn!(
                    target = "agent_gateway::gateway",
                    agent = %route.kind,
                    reason = %error.message,
                    "returning raw text after schema extraction failed"
                );
                (error.raw_text.unwrap_or_default(), None, true)
            }
            Err(error) => return Err(error),
        };

        Ok(ChatOutcome {
            usage: Usage::estimate(&prompt, &text),
            text,
            parsed_json,
            schema_extraction_failed,
            kind: route.kind,
            mode: route.mode,
        })
    }
}
