//! uplink entry point.
//!
//! `uplink tools` serves the demonstration uptime tool over an MCP
//! transport; `uplink proxy` runs the chat proxy.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use uplink::AppState;
use uplink::config::{Cli, Command, ProxyArgs, load_llm_settings};
use uplink::llm::ChatCompletionsDriver;
use uplink::mcp::McpConnector;
use uplink::server;
use uplink::session::{SessionManager, SessionOptions};
use uplink::tools;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How often the idle sweeper wakes up.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (M-LOG-STRUCTURED)
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env (if present)
    let _ = dotenv();

    match Cli::parse().command {
        Command::Tools(args) => tools::serve(args).await,
        Command::Proxy(args) => run_proxy(args).await,
    }
}

async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    let settings = load_llm_settings(&args.model);

    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.default_model,
        has_api_key = settings.api_key.is_some(),
        "LLM configuration loaded"
    );

    let connector = Arc::new(McpConnector::new(&args.tools_url)?);
    let sessions = SessionManager::new(
        connector,
        SessionOptions {
            idle_timeout: Duration::from_secs(args.session_idle_secs),
            replay_history: args.history_replay,
        },
    );
    sessions.spawn_idle_sweeper(SWEEP_PERIOD);

    let driver = Arc::new(ChatCompletionsDriver::new(settings.clone()));

    let state = AppState {
        settings,
        driver,
        sessions,
        runtime: args.runtime_options(),
    };

    let addr = format!("{}:{}", args.host, args.port);
    server::start_server(state, &addr).await
}
