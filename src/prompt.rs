//! Prompt shaping shared by the one-shot adapter and the session client.

use serde_json::Value;

/// Appended to every prompt unless the caller asks for raw mode.
pub const ONE_SHOT_INSTRUCTIONS: &str = "\n\n---\n\
IMPORTANT: This is a non-interactive, one-shot execution. You must:\n\
- Complete the entire task in a single response\n\
- Do NOT ask clarifying questions—make reasonable assumptions and state them\n\
- Do NOT wait for confirmation—proceed with the most sensible approach\n\
- If multiple interpretations exist, pick the most likely one and note your choice\n\
- Provide complete, working output rather than partial solutions";

const SCHEMA_PREAMBLE: &str = "\n\n---\n\
Respond with exactly one JSON object that conforms to the following JSON Schema. \
Output only the JSON object, without prose or code fences.\n";

pub fn wrap_prompt(prompt: &str) -> String {
    format!("{prompt}{ONE_SHOT_INSTRUCTIONS}")
}

/// Describe `schema` inside the prompt for agents without a schema flag.
pub fn embed_schema(prompt: &str, schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!("{prompt}{SCHEMA_PREAMBLE}{rendered}")
}

/// Apply the wrapping rule: instructions unless `raw`, then the schema block
/// when the schema cannot be passed natively.
pub fn prepare(prompt: &str, raw: bool, embedded_schema: Option<&Value>) -> String {
    let wrapped = if raw {
        prompt.to_string()
    } else {
        wrap_prompt(prompt)
    };
    match embedded_schema {
        Some(schema) => embed_schema(&wrapped, schema),
        None => wrapped,
    }
}
