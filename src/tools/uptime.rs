use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};

/// Arguments for the uptime tool.
#[derive(Debug, serde::Deserialize, rmcp::schemars::JsonSchema)]
#[schemars(crate = "rmcp::schemars")]
pub struct UptimeArgs {
    /// Number of days to report uptime for.
    pub days: i64,
}

/// The demonstration tool service.
///
/// The reported figure is a constant; this exists to exercise the
/// end-to-end tool path, not to measure anything.
#[derive(Clone)]
pub struct UptimeService {
    tool_router: ToolRouter<Self>,
}

impl Default for UptimeService {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_router]
impl UptimeService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    /// Calculates a fake uptime percentage based on days.
    #[tool(description = "Calculates a fake uptime percentage based on days.")]
    async fn calculate_uptime(
        &self,
        Parameters(UptimeArgs { days }): Parameters<UptimeArgs>,
    ) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(format_uptime(
            days,
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for UptimeService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Demonstration server exposing a fake uptime calculator.".to_string(),
            ),
            ..Default::default()
        }
    }
}

fn format_uptime(days: i64) -> String {
    format!("Uptime for the last {days} days: 99.9%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_message_format() {
        assert_eq!(format_uptime(30), "Uptime for the last 30 days: 99.9%");
        assert_eq!(format_uptime(0), "Uptime for the last 0 days: 99.9%");
    }

    #[test]
    fn test_figure_is_constant_regardless_of_input() {
        for days in [1, 7, 365, 10_000] {
            assert!(format_uptime(days).ends_with("99.9%"));
        }
    }

    #[test]
    fn test_server_advertises_tools() {
        let info = UptimeService::new().get_info();
        assert!(info.capabilities.tools.is_some());
    }
}
