//! Persistent daemon sessions.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::{AskOptions, SessionClient};
pub use manager::{Reply, SessionConfig, SessionManager, SessionState, TimeoutPolicy, TurnRequest};
#[cfg(unix)]
pub use transport::FifoLauncher;
pub use transport::{AgentCommand, AgentLauncher, SessionChannels, StdioLauncher};
