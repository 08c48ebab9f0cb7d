use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::llm::LlmSettings;

/// Default remote endpoint for the tool server. The proxy performs no
/// discovery; override with `UPLINK_TOOLS_URL`.
pub const DEFAULT_TOOLS_URL: &str = "http://127.0.0.1:8000/sse";

/// Default OpenAI-compatible API base.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demonstration uptime tool over an MCP transport
    Tools(ToolsArgs),
    /// Run the chat proxy
    Proxy(ProxyArgs),
}

/// MCP transport variants for the tool server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Line-based stdio, for local subprocess clients
    Stdio,
    /// HTTP Server-Sent Events at `/sse`
    Sse,
    /// Streamable HTTP at `/mcp`
    StreamableHttp,
}

#[derive(clap::Args, Debug)]
pub struct ToolsArgs {
    /// Transport to serve the tool set over
    #[arg(long, value_enum, default_value_t = Transport::Sse)]
    pub transport: Transport,

    /// Host to bind (ignored for stdio)
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind (ignored for stdio)
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
}

#[derive(clap::Args, Debug)]
pub struct ProxyArgs {
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Remote MCP tool server endpoint. URLs ending in `/sse` use the SSE
    /// transport; anything else uses streamable HTTP.
    #[arg(long, env = "UPLINK_TOOLS_URL", default_value = DEFAULT_TOOLS_URL)]
    pub tools_url: String,

    /// Default model when the request does not name one
    #[arg(long, env = "UPLINK_MODEL", default_value = "gpt-4o")]
    pub model: String,

    /// Maximum LLM/tool round-trips per chat turn
    #[arg(long, env = "UPLINK_MAX_STEPS", default_value_t = 10)]
    pub max_steps: usize,

    /// Wall-clock bound on a single chat turn, in seconds
    #[arg(long, env = "UPLINK_TURN_TIMEOUT_SECS", default_value_t = 120)]
    pub turn_timeout_secs: u64,

    /// Replay session history into each agent run
    #[arg(
        long,
        env = "UPLINK_HISTORY_REPLAY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub history_replay: bool,

    /// Idle seconds after which a session is swept
    #[arg(long, env = "UPLINK_SESSION_IDLE_SECS", default_value_t = 30 * 60)]
    pub session_idle_secs: u64,
}

/// Per-turn runtime options derived from [`ProxyArgs`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Ceiling on LLM/tool round-trips within one turn.
    pub max_steps: usize,
    /// Wall-clock bound on one turn.
    pub turn_timeout: Duration,
}

impl ProxyArgs {
    #[must_use]
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            max_steps: self.max_steps,
            turn_timeout: Duration::from_secs(self.turn_timeout_secs),
        }
    }
}

/// Load LLM settings from the environment.
///
/// `OPENAI_API_KEY` is deliberately optional here: its absence is surfaced
/// as a per-request configuration failure before any session work, so the
/// proxy still boots (and serves health checks) without a credential.
#[must_use]
pub fn load_llm_settings(default_model: &str) -> LlmSettings {
    let base_url = std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    LlmSettings {
        base_url,
        api_key,
        default_model: default_model.to_string(),
    }
}
