//! Model Context Protocol (MCP) client support for the chat proxy.
//!
//! Each chat session owns one remote tool-server connection. The
//! [`ToolBackend`] trait is the seam the agent executes tools through, and
//! [`ToolConnector`] is the construction seam, so tests can substitute
//! counting doubles for the real network client.

pub mod client;

pub use client::{McpConnector, McpToolClient, ToolBackend, ToolConnector};
