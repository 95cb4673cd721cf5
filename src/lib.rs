//! OpenAI-compatible gateway and persistent session daemon for command-line coding agents.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod invoker;
pub mod models;
pub mod oneshot;
pub mod prompt;
pub mod session;
