use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, Tool},
    service::ServiceExt,
    transport::{SseClientTransport, StreamableHttpClientTransport},
};
use url::Url;
use uuid::Uuid;

/// A connected remote tool server, as seen by the agent.
///
/// Implementations expose the discovered tool set in OpenAI function
/// schema format and forward `tools/call` requests.
#[async_trait]
pub trait ToolBackend: Send + Sync + std::fmt::Debug {
    /// Locally generated identifier for this connection.
    fn connection_id(&self) -> &str;

    /// Discovered tools as OpenAI function-schema JSON.
    fn tools_json(&self) -> Vec<serde_json::Value>;

    /// Execute a tool by its (sanitized) name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Constructs tool backends. One construction per new session.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ToolBackend>>;
}

type DynClientService = rmcp::service::RunningService<
    rmcp::service::RoleClient,
    Box<dyn rmcp::service::DynService<rmcp::service::RoleClient>>,
>;

/// rmcp-backed client for one remote MCP server.
///
/// Tools are listed once at connect time; names are sanitized for OpenAI
/// compatibility and indexed back to their raw server-side names.
pub struct McpToolClient {
    connection_id: String,
    service: DynClientService,
    // sanitized name -> raw tool name
    tool_index: HashMap<String, String>,
    tools: Vec<(String, Tool)>,
}

impl std::fmt::Debug for McpToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolClient")
            .field("connection_id", &self.connection_id)
            .field("tool_count", &self.tools.len())
            .finish()
    }
}

impl McpToolClient {
    /// Connect to `endpoint` and discover its tool set.
    ///
    /// URLs whose path ends in `/sse` use the SSE transport; anything else
    /// uses streamable HTTP.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be established or `tools/list` fails.
    pub async fn connect(endpoint: &Url) -> anyhow::Result<Self> {
        let service: DynClientService = if endpoint.path().ends_with("/sse") {
            let transport = SseClientTransport::start(endpoint.to_string())
                .await
                .with_context(|| format!("failed to open SSE transport to {endpoint}"))?;
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect SSE MCP server at {endpoint}"))?
        } else {
            let transport = StreamableHttpClientTransport::from_uri(endpoint.to_string());
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect MCP server at {endpoint}"))?
        };

        let listed = service
            .list_tools(Default::default())
            .await
            .with_context(|| format!("tools/list failed for MCP server at {endpoint}"))?;

        let mut tools: Vec<(String, Tool)> = Vec::new();
        let mut tool_index: HashMap<String, String> = HashMap::new();
        for t in listed.tools {
            let raw = t.name.to_string();
            let sanitized = sanitize_tool_name(&raw);
            tool_index.insert(sanitized.clone(), raw);
            tools.push((sanitized, t));
        }

        Ok(Self {
            connection_id: Uuid::new_v4().to_string(),
            service,
            tool_index,
            tools,
        })
    }
}

#[async_trait]
impl ToolBackend for McpToolClient {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn tools_json(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|(name, t)| tool_to_function_json(name, t))
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let raw_name = self
            .tool_index
            .get(name)
            .ok_or_else(|| anyhow!("unknown tool: {name}"))?
            .clone();

        let args_obj = arguments.as_object().cloned();
        let res = self
            .service
            .call_tool(CallToolRequestParam {
                name: raw_name.clone().into(),
                arguments: args_obj,
            })
            .await
            .with_context(|| format!("tools/call failed for {raw_name}"))?;

        Ok(serde_json::to_value(res)?)
    }
}

/// Connector bound to a fixed remote endpoint.
pub struct McpConnector {
    endpoint: Url,
}

impl McpConnector {
    /// # Errors
    ///
    /// Fails if `endpoint` is not a valid URL.
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid tool server url: {endpoint}"))?;
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl ToolConnector for McpConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ToolBackend>> {
        let client = McpToolClient::connect(&self.endpoint).await?;
        tracing::info!(
            name: "mcp.connected",
            endpoint = %self.endpoint,
            connection_id = %client.connection_id,
            tool_count = client.tools.len(),
            "Connected to tool server"
        );
        Ok(Arc::new(client))
    }
}

/// Convert one discovered tool into OpenAI function-schema JSON.
///
/// rmcp keeps `input_schema` as an `Arc<JsonObject>`; re-serialize it into
/// the `parameters` field.
fn tool_to_function_json(name: &str, t: &Tool) -> serde_json::Value {
    let params = serde_json::to_value(&*t.input_schema)
        .unwrap_or_else(|_| serde_json::json!({"type":"object","properties":{}}));

    serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": t.description.as_deref().unwrap_or(""),
            "parameters": params
        }
    })
}

/// Sanitize tool names for OpenAI API compatibility.
///
/// OpenAI requires `^[a-zA-Z0-9_-]+$`; dots, colons, and anything else
/// invalid become underscores.
fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("calculate_uptime"), "calculate_uptime");
        assert_eq!(sanitize_tool_name("time::now"), "time__now");
        assert_eq!(sanitize_tool_name("a.b c"), "a_b_c");
    }

    #[test]
    fn test_connector_rejects_bad_url() {
        assert!(McpConnector::new("not a url").is_err());
        assert!(McpConnector::new("http://127.0.0.1:8000/sse").is_ok());
    }

    #[test]
    fn test_tools_json_shape() {
        let tool = Tool {
            name: "calculate_uptime".to_string().into(),
            description: Some("Calculates a fake uptime percentage.".to_string().into()),
            input_schema: Arc::new(
                serde_json::json!({
                    "type": "object",
                    "properties": { "days": { "type": "integer" } },
                    "required": ["days"]
                })
                .as_object()
                .unwrap()
                .clone(),
            ),
            title: None,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        };

        let json = tool_to_function_json("calculate_uptime", &tool);
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "calculate_uptime");
        assert_eq!(json["function"]["parameters"]["required"][0], "days");
    }
}
