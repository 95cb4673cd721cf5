//! Line-delimited streaming JSON spoken by a persistent agent.
//!
//! Inbound, every user turn is one line:
//! `{"type":"user","message":{"role":"user","content":"..."}}`.
//! Outbound, the agent emits one JSON object per line and finishes a reply with
//! a `result` (or `error`) message.

use serde_json::{json, Value};

use crate::error::{AgentError, Result};

/// Sent as an ordinary user message to clear the agent's conversation.
pub const RESET_COMMAND: &str = "/clear";

/// Encode `content` as one user-message line, without the trailing newline.
pub fn encode_user_message(content: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    })
    .to_string()
}

/// Parse one outbound line. Blank lines, non-JSON noise and non-object values
/// yield `None`.
pub fn parse_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn message_type(message: &Value) -> &str {
    message.get("type").and_then(Value::as_str).unwrap_or("")
}

/// True for the message that ends a reply.
pub fn is_terminal(message: &Value) -> bool {
    matches!(message_type(message), "result" | "error")
}

/// Reduces the messages of one reply to its final text.
///
/// Streamed `text_delta` fragments take precedence over whole `assistant`
/// text blocks (an agent that streams also repeats the full block), and the
/// `result` string on the terminal message overrides both.
#[derive(Debug, Default)]
pub struct ReplyCollector {
    messages: Vec<Value>,
    deltas: String,
    blocks: Vec<String>,
    result: Option<String>,
    failure: Option<String>,
    complete: bool,
}

impl ReplyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message; returns `true` once the terminal marker is seen.
    pub fn push(&mut self, message: Value) -> bool {
        match message_type(&message) {
            "stream_event" => {
                if let Some(event) = message.get("event") {
                    self.push_delta(event);
                }
            }
            "content_block_delta" => self.push_delta(&message),
            "assistant" => self.push_assistant(&message),
            "result" => {
                let text = message
                    .get("result")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                let is_error = message
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    self.failure = Some(
                        text.filter(|text| !text.is_empty())
                            .or_else(|| subtype(&message))
                            .unwrap_or_else(|| "agent reported an error".to_string()),
                    );
                } else {
                    self.result = text;
                }
                self.complete = true;
            }
            "error" => {
                self.failure = Some(error_text(&message));
                self.complete = true;
            }
            _ => {}
        }
        self.messages.push(message);
        self.complete
    }

    /// Best-effort text gathered so far, for partial output on timeout.
    pub fn partial_text(&self) -> String {
        if self.deltas.is_empty() {
            self.blocks.concat()
        } else {
            self.deltas.clone()
        }
    }

    /// Final text and the raw messages, or `AgentFailed` when the agent
    /// reported an error.
    pub fn finish(self) -> Result<(String, Vec<Value>)> {
        if let Some(failure) = self.failure {
            return Err(AgentError::agent_failed(failure).with_raw_text(self.deltas));
        }
        let text = match self.result {
            Some(result) if !result.is_empty() => result,
            _ if !self.deltas.is_empty() => self.deltas,
            _ => self.blocks.concat(),
        };
        Ok((text, self.messages))
    }

    fn push_delta(&mut self, event: &Value) {
        if message_type(event) != "content_block_delta" {
            return;
        }
        let delta = event.get("delta");
        let is_text = delta
            .and_then(|delta| delta.get("type"))
            .and_then(Value::as_str)
            == Some("text_delta");
        if let Some(text) = delta
            .filter(|_| is_text)
            .and_then(|delta| delta.get("text"))
            .and_then(Value::as_str)
        {
            self.deltas.push_str(text);
        }
    }

    fn push_assistant(&mut self, message: &Value) {
        let Some(content) = message.get("message").and_then(|m| m.get("content")) else {
            return;
        };
        match content {
            Value::String(text) => self.blocks.push(text.clone()),
            Value::Array(blocks) => {
                for block in blocks {
                    if message_type(block) == "text" {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            self.blocks.push(text.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn subtype(message: &Value) -> Option<String> {
    message
        .get("subtype")
        .and_then(Value::as_str)
        .map(|subtype| format!("agent reported {subtype}"))
}

fn error_text(message: &Value) -> String {
    let error = message.get("error");
    error
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(Value::as_str))
        .or_else(|| message.get("message").and_then(Value::as_str))
        .unwrap_or("agent reported an error")
        .to_string()
}
