//! Per-agent CLI invocation patterns, encoded as data.
//!
//! Each supported agent is a [`BackendKind`] plus a [`BackendProfile`]
//! describing its program, the fixed non-interactive flags, how the prompt is
//! delivered and how structured output is requested. Adding a backend means
//! adding a variant and a `builtin` entry; no call site branches on kind.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    #[serde(rename = "amazonq")]
    AmazonQ,
    Codex,
    Aider,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Claude,
        BackendKind::AmazonQ,
        BackendKind::Codex,
        BackendKind::Aider,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::AmazonQ => "amazonq",
            Self::Codex => "codex",
            Self::Aider => "aider",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(Self::Claude),
            "amazonq" | "amazon-q" | "q" => Ok(Self::AmazonQ),
            "codex" => Ok(Self::Codex),
            "aider" => Ok(Self::Aider),
            other => Err(format!(
                "unknown agent '{other}' (expected one of: claude, amazonq, codex, aider)"
            )),
        }
    }
}

/// Where the (wrapped) prompt goes on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDelivery {
    /// Piped to the child's stdin.
    Stdin,
    /// Appended as the final positional argument.
    TrailingArg,
    /// Passed as the value of a flag, e.g. `--message <prompt>`.
    Flag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSupport {
    /// The CLI accepts the JSON schema through a flag.
    Native { flag: String },
    /// The schema is described inside the prompt.
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub kind: BackendKind,
    pub program: String,
    /// Fixed arguments placed before everything else (subcommands and
    /// non-interactive flags).
    pub args: Vec<String>,
    pub model_flag: Option<String>,
    pub prompt: PromptDelivery,
    pub schema: SchemaSupport,
    /// Arguments for the persistent streaming-JSON mode, when the agent has one.
    pub session_args: Option<Vec<String>>,
}

/// argv and stdin for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}

impl BackendProfile {
    pub fn builtin(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Claude => Self {
                kind,
                program: "claude".into(),
                args: strings(&[
                    "-p",
                    "--dangerously-skip-permissions",
                    "--no-session-persistence",
                ]),
                model_flag: Some("--model".into()),
                prompt: PromptDelivery::Stdin,
                schema: SchemaSupport::Native {
                    flag: "--json-schema".into(),
                },
                session_args: Some(strings(&[
                    "-p",
                    "--input-format",
                    "stream-json",
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--dangerously-skip-permissions",
                ])),
            },
            BackendKind::AmazonQ => Self {
                kind,
                program: "q".into(),
                args: strings(&["chat", "--no-interactive", "--trust-all-tools"]),
                model_flag: Some("--model".into()),
                prompt: PromptDelivery::Stdin,
                schema: SchemaSupport::Embedded,
                session_args: None,
            },
            BackendKind::Codex => Self {
                kind,
                program: "codex".into(),
                args: strings(&["exec", "--full-auto"]),
                model_flag: Some("--model".into()),
                prompt: PromptDelivery::TrailingArg,
                schema: SchemaSupport::Embedded,
                session_args: None,
            },
            BackendKind::Aider => Self {
                kind,
                program: "aider".into(),
                args: strings(&["--yes-always", "--no-git", "--no-auto-commits"]),
                model_flag: Some("--model".into()),
                prompt: PromptDelivery::Flag("--message".into()),
                schema: SchemaSupport::Embedded,
                session_args: None,
            },
        }
    }

    /// Replace the program with a user supplied command line such as
    /// `npx @anthropic-ai/claude-code`. Extra words become leading arguments.
    pub fn with_command(mut self, command: &str) -> Result<Self, AgentError> {
        let (program, mut leading) = parse_cli_command(command)?;
        if let Some(session_args) = self.session_args.as_mut() {
            let mut merged = leading.clone();
            merged.append(session_args);
            *session_args = merged;
        }
        leading.append(&mut self.args);
        self.program = program;
        self.args = leading;
        Ok(self)
    }

    pub fn supports_native_schema(&self) -> bool {
        matches!(self.schema, SchemaSupport::Native { .. })
    }

    /// Build the one-shot argv. `schema` is only consulted for native schema
    /// support; embedded schemas are already part of `prompt`.
    pub fn one_shot(&self, prompt: &str, schema: Option<&str>, model: Option<&str>) -> Invocation {
        let mut args = self.args.clone();
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        if let (SchemaSupport::Native { flag }, Some(schema)) = (&self.schema, schema) {
            args.push(flag.clone());
            args.push(schema.to_string());
        }

        let stdin = match &self.prompt {
            PromptDelivery::Stdin => Some(prompt.to_string()),
            PromptDelivery::TrailingArg => {
                args.push(prompt.to_string());
                None
            }
            PromptDelivery::Flag(flag) => {
                args.push(flag.clone());
                args.push(prompt.to_string());
                None
            }
        };

        Invocation {
            program: self.program.clone(),
            args,
            stdin,
        }
    }

    /// Build the argv for the persistent session process.
    pub fn session(&self, model: Option<&str>) -> Option<Invocation> {
        let mut args = self.session_args.clone()?;
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        Some(Invocation {
            program: self.program.clone(),
            args,
            stdin: None,
        })
    }
}

/// Split a command string into program and inline arguments.
pub fn parse_cli_command(raw: &str) -> Result<(String, Vec<String>), AgentError> {
    let parts = shlex::split(raw)
        .ok_or_else(|| AgentError::invalid_request(format!("invalid command '{raw}'")))?;
    let mut parts = parts.into_iter();
    let program = parts
        .next()
        .filter(|program| !program.is_empty())
        .ok_or_else(|| AgentError::invalid_request("command must not be empty"))?;
    Ok((program, parts.collect()))
}

/// Immutable set of profiles shared by every one-shot call.
#[derive(Debug, Clone)]
pub struct BackendTable {
    profiles: HashMap<BackendKind, BackendProfile>,
}

impl Default for BackendTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BackendTable {
    pub fn builtin() -> Self {
        Self {
            profiles: BackendKind::ALL
                .iter()
                .map(|kind| (*kind, BackendProfile::builtin(*kind)))
                .collect(),
        }
    }

    /// Apply `kind=command` overrides.
    pub fn with_overrides<'a, I>(mut self, overrides: I) -> Result<Self, AgentError>
    where
        I: IntoIterator<Item = &'a (BackendKind, String)>,
    {
        for (kind, command) in overrides {
            let profile = self.get(*kind).clone().with_command(command)?;
            self.profiles.insert(*kind, profile);
        }
        Ok(self)
    }

    pub fn with_profile(mut self, profile: BackendProfile) -> Self {
        self.profiles.insert(profile.kind, profile);
        self
    }

    pub fn get(&self, kind: BackendKind) -> &BackendProfile {
        // Every kind is inserted by `builtin` and overrides only replace.
        &self.profiles[&kind]
    }
}

/// Parse a `kind=command` CLI override.
pub fn parse_agent_command(raw: &str) -> Result<(BackendKind, String), String> {
    let (kind, command) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=COMMAND, got '{raw}'"))?;
    let kind = kind.parse::<BackendKind>()?;
    let command = command.trim();
    if command.is_empty() {
        return Err(format!("empty command for agent '{kind}'"));
    }
    Ok((kind, command.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_one_shot_uses_native_schema_and_stdin() {
        let profile = BackendProfile::builtin(BackendKind::Claude);
        let inv = profile.one_shot("hi", Some(r#"{"type":"object"}"#), Some("opus"));
        assert_eq!(inv.program, "claude");
        assert_eq!(
            inv.args,
            vec![
                "-p",
                "--dangerously-skip-permissions",
                "--no-session-persistence",
                "--model",
                "opus",
                "--json-schema",
                r#"{"type":"object"}"#,
            ]
        );
        assert_eq!(inv.stdin.as_deref(), Some("hi"));
    }

    #[test]
    fn amazonq_pipes_prompt_with_non_interactive_flag() {
        let inv = BackendProfile::builtin(BackendKind::AmazonQ).one_shot("hi", None, None);
        assert_eq!(inv.program, "q");
        assert_eq!(inv.args, vec!["chat", "--no-interactive", "--trust-all-tools"]);
        assert_eq!(inv.stdin.as_deref(), Some("hi"));
    }

    #[test]
    fn codex_prompt_is_trailing_argument() {
        let inv = BackendProfile::builtin(BackendKind::Codex).one_shot("do it", None, None);
        assert_eq!(inv.args, vec!["exec", "--full-auto", "do it"]);
        assert!(inv.stdin.is_none());
    }

    #[test]
    fn aider_avoids_git_and_passes_message_flag() {
        let inv = BackendProfile::builtin(BackendKind::Aider).one_shot("fix", None, Some("gpt-4"));
        assert_eq!(
            inv.args,
            vec![
                "--yes-always",
                "--no-git",
                "--no-auto-commits",
                "--model",
                "gpt-4",
                "--message",
                "fix",
            ]
        );
    }

    #[test]
    fn embedded_schema_backends_ignore_schema_argument() {
        let inv = BackendProfile::builtin(BackendKind::Codex).one_shot("p", Some("{}"), None);
        assert!(!inv.args.iter().any(|arg| arg == "{}"));
    }

    #[test]
    fn only_claude_has_session_mode() {
        let session = BackendProfile::builtin(BackendKind::Claude)
            .session(None)
            .unwrap();
        assert!(session.args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(session.args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(BackendProfile::builtin(BackendKind::Codex).session(None).is_none());
    }

    #[test]
    fn command_override_prepends_inline_args() {
        let profile = BackendProfile::builtin(BackendKind::Claude)
            .with_command("npx @anthropic-ai/claude-code")
            .unwrap();
        assert_eq!(profile.program, "npx");
        assert_eq!(profile.args[0], "@anthropic-ai/claude-code");
        assert_eq!(profile.args[1], "-p");
        assert_eq!(profile.session_args.unwrap()[0], "@anthropic-ai/claude-code");
    }

    #[test]
    fn kind_parsing_accepts_aliases() {
        assert_eq!("amazon-q".parse::<BackendKind>().unwrap(), BackendKind::AmazonQ);
        assert_eq!("Claude".parse::<BackendKind>().unwrap(), BackendKind::Claude);
        assert!("gemini".parse::<BackendKind>().is_err());
    }

    #[test]
    fn agent_command_override_parses() {
        let (kind, command) = parse_agent_command("codex=/opt/bin/codex --quiet").unwrap();
        assert_eq!(kind, BackendKind::Codex);
        assert_eq!(command, "/opt/bin/codex --quiet");
        assert!(parse_agent_command("codex").is_err());
        assert!(parse_agent_command("codex=").is_err());
    }
}
