//! OpenAI-compatible HTTP surface.
//!
//! `/health` is public; everything under `/v1` goes through the bearer-key
//! middleware when a key is configured.

use std::{convert::Infallible, path::PathBuf, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::AgentError,
    gateway::{ChatMessage, ChatOutcome, ChatRequest, Gateway},
};

/// Characters per simulated streaming chunk.
const STREAM_CHUNK_CHARS: usize = 20;

#[derive(Clone)]
struct ApiState {
    gateway: Arc<Gateway>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    #[serde(default = "default_model")]
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    response_format: Option<Value>,
    /// Working directory for the agent.
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    preserve_context: bool,
}

fn default_model() -> String {
    "claude-code".to_string()
}

pub fn router(gateway: Arc<Gateway>, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = ApiState {
        gateway,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/v1/models", routing::get(list_models))
        .route("/v1/chat/completions", routing::post(chat_completions))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", routing::get(health))
        .merge(protected)
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let mut body = json!({ "status": "ok", "service": "agent-gateway" });
    if let Some(daemon) = state.gateway.daemon() {
        let manager = daemon.manager();
        body["daemon"] = json!({
            "agent": manager.kind(),
            "state": manager.state(),
            "pid": manager.pid(),
        });
    }
    Json(body)
}

async fn list_models(State(state): State<ApiState>) -> Json<Value> {
    let data: Vec<Value> = state
        .gateway
        .models()
        .listed()
        .map(|descriptor| {
            json!({
                "id": descriptor.id,
                "object": "model",
                "owned_by": descriptor.owned_by,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn chat_completions(
    State(state): State<ApiState>,
    payload: Result<Json<ChatCompletionBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return error_response(&AgentError::invalid_request(format!(
                "invalid request body: {}",
                rejection.body_text()
            )))
        }
    };

    let request = ChatRequest {
        model: body.model.clone(),
        messages: body.messages,
        schema: response_schema(body.response_format.as_ref()),
        working_dir: body
            .context
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from),
        preserve_context: body.preserve_context,
    };

    match state.gateway.complete_chat(&request).await {
        Ok(outcome) if body.stream => stream_response(&outcome, &body.model).into_response(),
        Ok(outcome) => Json(completion_body(&outcome, &body.model)).into_response(),
        Err(error) => {
            tracing::warn!(
                target = "agent_gateway::api",
                model = %body.model,
                kind = %error.kind,
                error = %error.message,
                "chat completion failed"
            );
            error_response(&error)
        }
    }
}

/// `response_format: {"type":"json_schema","json_schema":{"schema":{...}}}`.
fn response_schema(response_format: Option<&Value>) -> Option<Value> {
    let format = response_format?;
    if format.get("type").and_then(Value::as_str) != Some("json_schema") {
        return None;
    }
    format
        .get("json_schema")
        .and_then(|json_schema| json_schema.get("schema"))
        .filter(|schema| !schema.is_null())
        .cloned()
}

fn completion_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &id[..12])
}

/// Message content: compact parsed JSON when available, else the reply text.
fn reply_content(outcome: &ChatOutcome) -> String {
    match &outcome.parsed_json {
        Some(parsed) => parsed.to_string(),
        None => outcome.text.clone(),
    }
}

fn completion_body(outcome: &ChatOutcome, model: &str) -> Value {
    let mut body = json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply_content(outcome) },
            "finish_reason": "stop",
        }],
        "usage": outcome.usage,
    });
    if outcome.schema_extraction_failed {
        body["schema_extraction_failed"] = Value::Bool(true);
    }
    body
}

fn stream_chunks(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(STREAM_CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn stream_response(
    outcome: &ChatOutcome,
    model: &str,
) -> Sse<impl futures_lite::Stream<Item = Result<Event, Infallible>>> {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    let chunks = stream_chunks(&reply_content(outcome));
    let last = chunks.len() - 1;

    let mut events: Vec<Event> = chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let delta = if chunk.is_empty() {
                json!({})
            } else {
                json!({ "content": chunk })
            };
            let finish_reason = (index == last).then_some("stop");
            let frame = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish_reason,
                }],
            });
            Event::default().data(frame.to_string())
        })
        .collect();
    events.push(Event::default().data("[DONE]"));

    Sse::new(futures_lite::stream::iter(events.into_iter().map(Ok)))
}

fn error_envelope(error: &AgentError) -> Value {
    json!({
        "error": {
            "message": error.message,
            "type": error.kind.as_str(),
            "retryable": error.is_retryable(),
        }
    })
}

fn error_response(error: &AgentError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_envelope(error))).into_response()
}

async fn auth_middleware(
    State(state): State<ApiState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    // Authorization: Bearer <key>, or X-API-Key: <key>
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "message": "Invalid API key",
                    "type": "auth_error",
                    "retryable": false,
                }
            })),
        ));
    }

    Ok(next.run(request).await)
}
