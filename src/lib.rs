//! uplink
//!
//! A small Model Context Protocol demonstration stack: a tool server that
//! exposes a fake uptime calculator over three transports, and a chat proxy
//! that forwards queries to an LLM agent which calls the tool server over
//! the network.
//!
//! # Architecture
//!
//! - **Tool server**: rmcp `ServerHandler` servable over stdio, SSE, or
//!   streamable HTTP
//! - **Chat proxy**: Axum-based HTTP server with per-session state
//! - **Agent**: tool-loop execution bounded by a step ceiling
//! - **MCP client**: one remote connection per chat session
//!
//! # Modules
//!
//! - [`llm`]: LLM driver trait and the Chat Completions implementation
//! - [`agent`]: tool-loop agent
//! - [`mcp`]: MCP tool client and connection seam
//! - [`session`]: session records and the session manager
//! - [`server`]: chat proxy routes
//! - [`tools`]: the uptime tool service and its transport bindings

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod server;
pub mod session;
pub mod tools;

use std::sync::Arc;

use config::RuntimeOptions;
use llm::{LlmDriver, LlmSettings};
use session::SessionManager;

/// Application state shared across all proxy handlers.
#[derive(Clone)]
pub struct AppState {
    /// LLM connection settings (base URL, credential, default model).
    pub settings: LlmSettings,
    /// Streaming LLM driver used by every agent.
    pub driver: Arc<dyn LlmDriver>,
    /// Session manager owning all conversation state.
    pub sessions: SessionManager,
    /// Per-turn runtime options (step ceiling, timeout, history replay).
    pub runtime: RuntimeOptions,
}
