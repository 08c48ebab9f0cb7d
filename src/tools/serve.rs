use std::net::SocketAddr;

use rmcp::{
    ServiceExt,
    transport::{
        sse_server::SseServer,
        stdio,
        streamable_http_server::{StreamableHttpService, session::local::LocalSessionManager},
    },
};
use tracing::info;

use super::UptimeService;
use crate::config::{ToolsArgs, Transport};

/// Serve the uptime tool over the selected transport until shutdown.
///
/// # Errors
///
/// Fails if the transport cannot bind or the serve loop errors.
pub async fn serve(args: ToolsArgs) -> anyhow::Result<()> {
    match args.transport {
        Transport::Stdio => serve_stdio().await,
        Transport::Sse => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
            serve_sse(addr).await
        }
        Transport::StreamableHttp => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
            serve_streamable_http(addr).await
        }
    }
}

async fn serve_stdio() -> anyhow::Result<()> {
    info!(name: "tools.started", transport = "stdio", "Tool server started");
    let service = UptimeService::new().serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

async fn serve_sse(addr: SocketAddr) -> anyhow::Result<()> {
    let ct = SseServer::serve(addr)
        .await?
        .with_service(UptimeService::new);

    info!(
        name: "tools.started",
        transport = "sse",
        address = %addr,
        "Tool server started"
    );

    tokio::signal::ctrl_c().await?;
    ct.cancel();
    Ok(())
}

async fn serve_streamable_http(addr: SocketAddr) -> anyhow::Result<()> {
    let service = StreamableHttpService::new(
        || Ok(UptimeService::new()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        name: "tools.started",
        transport = "streamable-http",
        address = %addr,
        "Tool server started"
    );

    axum::serve(listener, router).await?;
    Ok(())
}
