//! Error types shared by the invoker, one-shot adapter and session manager.
//!
//! Every failure surfaces as an [`AgentError`] value carrying an
//! [`ErrorKind`]. The HTTP layer maps kinds to status codes; the session
//! manager uses [`ErrorKind::SessionBroken`] to tell callers that the whole
//! backend needs restarting rather than just their request.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Category of an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The external program could not be started.
    Spawn,
    /// No terminal signal arrived within the time budget.
    Timeout,
    /// A schema was requested but no conforming JSON object was found.
    SchemaExtractionFailed,
    /// The persistent session's process or channels failed.
    SessionBroken,
    /// Rejected by the queueing policy; retry later.
    Busy,
    /// The agent ran but reported failure (non-zero exit or error message).
    AgentFailed,
    /// The caller's request could not be served as given.
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn_error",
            Self::Timeout => "timeout",
            Self::SchemaExtractionFailed => "schema_extraction_failed",
            Self::SessionBroken => "session_broken",
            Self::Busy => "busy",
            Self::AgentFailed => "agent_failed",
            Self::InvalidRequest => "invalid_request_error",
        }
    }

    /// HTTP status the gateway reports for this kind.
    ///
    /// Schema extraction failures are still a success: the caller receives
    /// the raw text with a flag instead of parsed JSON.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Spawn => 500,
            Self::Timeout => 504,
            Self::SchemaExtractionFailed => 200,
            Self::SessionBroken => 503,
            Self::Busy => 429,
            Self::AgentFailed => 502,
            Self::InvalidRequest => 400,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed agent call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    /// Output captured before the failure (partial stdout on timeout, the
    /// unparsed reply on schema failure).
    pub raw_text: Option<String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw_text: None,
        }
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn schema_extraction_failed(message: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaExtractionFailed, message).with_raw_text(raw_text)
    }

    pub fn session_broken(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionBroken, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn agent_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AgentFailed, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }

    /// Check if retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::Busy)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
