//! Static model-id table: which agent (and which model override) serves a
//! requested model name.

use serde::Serialize;

use crate::backend::{BackendKind, BackendTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub kind: BackendKind,
    /// Passed to the agent's model flag when set.
    pub model: Option<String>,
    pub supports_structured_output: bool,
    pub owned_by: String,
    /// Whether `/v1/models` advertises this id. Aliases are routable but
    /// unlisted.
    #[serde(skip)]
    pub listed: bool,
}

#[derive(Debug, Clone)]
pub struct ModelTable {
    entries: Vec<BackendDescriptor>,
}

impl ModelTable {
    pub fn builtin(backends: &BackendTable) -> Self {
        let rows: [(&str, BackendKind, Option<&str>, &str, bool); 9] = [
            ("claude-code", BackendKind::Claude, None, "anthropic", true),
            ("claude-code-opus", BackendKind::Claude, Some("opus"), "anthropic", true),
            ("claude-code-sonnet", BackendKind::Claude, Some("sonnet"), "anthropic", true),
            ("amazon-q", BackendKind::AmazonQ, None, "amazon", true),
            ("amazonq", BackendKind::AmazonQ, None, "amazon", false),
            ("codex", BackendKind::Codex, None, "openai", true),
            ("aider", BackendKind::Aider, None, "aider", true),
            ("aider-gpt4", BackendKind::Aider, Some("gpt-4"), "aider", true),
            (
                "aider-claude",
                BackendKind::Aider,
                Some("claude-3-opus-20240229"),
                "aider",
                true,
            ),
        ];

        let entries = rows
            .into_iter()
            .map(|(id, kind, model, owned_by, listed)| BackendDescriptor {
                id: id.to_string(),
                kind,
                model: model.map(ToOwned::to_owned),
                supports_structured_output: backends.get(kind).supports_native_schema(),
                owned_by: owned_by.to_string(),
                listed,
            })
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, id: &str) -> Option<&BackendDescriptor> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn listed(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.entries.iter().filter(|entry| entry.listed)
    }
}
