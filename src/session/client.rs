//! Per-call facade over a [`SessionManager`].

use std::time::Duration;

use serde_json::Value;

use super::manager::{Reply, SessionManager, TurnRequest};
use crate::{backend::BackendKind, error::Result, prompt};

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Skip the context reset after this turn so the next one can build on it.
    pub preserve_context: bool,
    /// Send the prompt without the one-shot instruction block.
    pub raw_prompt: bool,
    pub timeout: Option<Duration>,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SessionClient {
    manager: SessionManager,
}

impl SessionClient {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn kind(&self) -> BackendKind {
        self.manager.kind()
    }

    /// Ask the daemon agent one question.
    ///
    /// The session's command line is fixed at startup, so a schema is always
    /// described inside the prompt.
    pub async fn ask(&self, prompt: &str, options: AskOptions) -> Result<Reply> {
        let prompt = prompt::prepare(prompt, options.raw_prompt, options.schema.as_ref());
        self.manager
            .submit(TurnRequest {
                prompt,
                schema: options.schema,
                preserve_context: options.preserve_context,
                timeout: options.timeout,
            })
            .await
    }
}
