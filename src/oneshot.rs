//! One-shot invocation: one process per request, run to completion.
//!
//! The adapter holds only immutable configuration, so a single instance can
//! serve any number of concurrent calls.

use std::{path::Path, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    backend::{BackendKind, BackendTable},
    error::{AgentError, Result},
    extract::extract_structured,
    invoker::{invoke, InvokeRequest},
    prompt,
};

pub const DEFAULT_ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct OneShotRequest<'a> {
    pub kind: BackendKind,
    pub prompt: &'a str,
    pub schema: Option<&'a Value>,
    pub context_dir: Option<&'a Path>,
    pub model: Option<&'a str>,
    pub raw: bool,
}

impl<'a> OneShotRequest<'a> {
    pub fn new(kind: BackendKind, prompt: &'a str) -> Self {
        Self {
            kind,
            prompt,
            schema: None,
            context_dir: None,
            model: None,
            raw: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OneShotOutput {
    pub text: String,
    pub parsed_json: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct OneShotAdapter {
    backends: Arc<BackendTable>,
    timeout: Duration,
}

impl OneShotAdapter {
    pub fn new(backends: Arc<BackendTable>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    pub async fn run(&self, request: OneShotRequest<'_>) -> Result<OneShotOutput> {
        let profile = self.backends.get(request.kind);
        let native_schema = profile.supports_native_schema();

        let embedded = request.schema.filter(|_| !native_schema);
        let prompt = prompt::prepare(request.prompt, request.raw, embedded);
        let schema_arg = match request.schema.filter(|_| native_schema) {
            Some(schema) => Some(serde_json::to_string(schema).map_err(|error| {
                AgentError::invalid_request(format!("schema is not serializable: {error}"))
            })?),
            None => None,
        };

        let invocation = profile.one_shot(&prompt, schema_arg.as_deref(), request.model);
        let mut invoke_request =
            InvokeRequest::new(invocation.program, self.timeout).with_args(invocation.args);
        if let Some(stdin) = invocation.stdin {
            invoke_request = invoke_request.with_stdin(stdin);
        }
        if let Some(dir) = request.context_dir {
            invoke_request = invoke_request.with_working_dir(dir);
        }

        tracing::info!(
            target = "agent_gateway::oneshot",
            agent = %request.kind,
            model = request.model.unwrap_or("default"),
            structured = request.schema.is_some(),
            "invoking agent"
        );
        let output = invoke(&invoke_request).await?;

        if !output.success() {
            let stderr = output.stderr.trim();
            let message = if stderr.is_empty() {
                "Agent execution failed".to_string()
            } else {
                stderr.to_string()
            };
            tracing::warn!(
                target = "agent_gateway::oneshot",
                agent = %request.kind,
                exit_code = ?output.exit_code,
                "agent exited with failure"
            );
            return Err(AgentError::agent_failed(message).with_raw_text(output.stdout));
        }

        let text = output.stdout.trim().to_string();
        let parsed_json = match request.schema {
            Some(schema) => Some(extract_structured(&text, schema)?),
            None => None,
        };
        Ok(OneShotOutput { text, parsed_json })
    }
}
