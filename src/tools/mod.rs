//! Demonstration MCP tool server.
//!
//! Exposes a single tool, `calculate_uptime`, over the caller's choice of
//! stdio, SSE, or streamable HTTP. Protocol handling, schema derivation,
//! and transport plumbing are all delegated to rmcp.

mod serve;
mod uptime;

pub use serve::serve;
pub use uptime::UptimeService;
