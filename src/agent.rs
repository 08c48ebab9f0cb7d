//! Tool-loop agent.
//!
//! The agent manages the complete lifecycle of one chat turn:
//! 1. Send the conversation to the LLM
//! 2. Stream the response, accumulating text and tool calls
//! 3. Execute tool calls against the session's tool backend
//! 4. Feed tool results back to the LLM
//! 5. Repeat until the model produces a final response
//!
//! Each turn is bounded by a step ceiling. Exceeding it is signaled as the
//! distinct [`AgentError::StepCeiling`] variant rather than inferred from
//! error text, so callers can recover it explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::llm::{LlmDriver, LlmRequest, Message, StreamEvent, ToolCall, ToolCallFunction};
use crate::mcp::ToolBackend;

/// Failures from one agent run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The run hit its LLM/tool round-trip ceiling before the model
    /// produced a final response.
    #[error("agent exceeded the step ceiling after {steps} steps")]
    StepCeiling {
        /// The ceiling that was hit.
        steps: usize,
    },

    /// The LLM driver failed.
    #[error("llm driver failed: {0}")]
    Driver(#[source] anyhow::Error),
}

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default, Clone)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// An agent bound to one tool backend and one model.
///
/// Constructed once per session via the session's get-or-create accessor
/// and reused for every subsequent turn.
pub struct Agent {
    driver: Arc<dyn LlmDriver>,
    tools: Arc<dyn ToolBackend>,
    model: String,
    max_steps: usize,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl Agent {
    #[must_use]
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        tools: Arc<dyn ToolBackend>,
        model: impl Into<String>,
        max_steps: usize,
    ) -> Self {
        Self {
            driver,
            tools,
            model: model.into(),
            max_steps,
        }
    }

    /// Get the model this agent is bound to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run the agent over `messages` until the model produces a final
    /// response, executing tool calls along the way.
    ///
    /// # Errors
    ///
    /// [`AgentError::StepCeiling`] when the round-trip ceiling is hit;
    /// [`AgentError::Driver`] for any LLM failure. Tool failures are fed
    /// back to the model as error content, not raised.
    pub async fn run(&self, messages: Vec<Message>) -> Result<String, AgentError> {
        let request_id = Uuid::new_v4().to_string();
        let tools = self.tools.tools_json();

        tracing::info!(
            request_id = %request_id,
            message_count = messages.len(),
            tool_count = tools.len(),
            model = %self.model,
            "Starting agent run"
        );

        let mut message_json: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or_default())
            .collect();

        for step in 1..=self.max_steps {
            tracing::debug!(
                request_id = %request_id,
                step = step,
                message_count = message_json.len(),
                "Starting tool loop step"
            );

            let req = LlmRequest {
                model: self.model.clone(),
                messages: message_json.clone(),
                tools: tools.clone(),
            };

            let mut stream = self.driver.stream(req).await.map_err(AgentError::Driver)?;

            let mut accumulators: BTreeMap<usize, ToolCallAccumulator> = BTreeMap::new();
            let mut assistant_text = String::new();
            let mut has_tool_calls = false;

            while let Some(result) = stream.next().await {
                match result.map_err(AgentError::Driver)? {
                    StreamEvent::MessageDelta { text } => {
                        assistant_text.push_str(&text);
                    }
                    StreamEvent::ToolCallDelta {
                        call_index,
                        id,
                        name,
                        arguments_delta,
                    } => {
                        has_tool_calls = true;
                        let acc = accumulators.entry(call_index).or_default();
                        if acc.id.is_none() {
                            acc.id = id;
                        }
                        if acc.name.is_none() {
                            acc.name = name;
                        }
                        if let Some(delta) = arguments_delta {
                            acc.arguments.push_str(&delta);
                        }
                    }
                    StreamEvent::ToolCallComplete { .. } => {
                        has_tool_calls = true;
                    }
                    StreamEvent::Done => {}
                }
            }

            let tool_calls: Vec<ToolCall> = accumulators
                .values()
                .filter_map(|acc| {
                    let id = acc.id.clone()?;
                    let name = acc.name.clone()?;
                    Some(ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: ToolCallFunction {
                            name,
                            arguments: acc.arguments.clone(),
                        },
                    })
                })
                .collect();

            if !has_tool_calls || tool_calls.is_empty() {
                tracing::info!(
                    request_id = %request_id,
                    step = step,
                    response_length = assistant_text.len(),
                    "Agent run complete"
                );
                return Ok(assistant_text);
            }

            // The model asked for tools: record its message, execute each
            // call, and feed results back for the next step.
            message_json.push(serde_json::json!({
                "role": "assistant",
                "content": if assistant_text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(assistant_text.clone()) },
                "tool_calls": tool_calls.iter().map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": tc.call_type,
                        "function": {
                            "name": tc.function.name,
                            "arguments": tc.function.arguments
                        }
                    })
                }).collect::<Vec<_>>()
            }));

            for tool_call in &tool_calls {
                let tool_name = &tool_call.function.name;
                let arguments: serde_json::Value =
                    serde_json::from_str(&tool_call.function.arguments)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

                tracing::info!(
                    request_id = %request_id,
                    step = step,
                    tool_id = %tool_call.id,
                    tool_name = %tool_name,
                    "Executing tool call"
                );

                let content = match self.tools.call_tool(tool_name, arguments).await {
                    Ok(result) => serde_json::to_string(&result).unwrap_or_default(),
                    Err(e) => {
                        tracing::error!(
                            request_id = %request_id,
                            tool_id = %tool_call.id,
                            tool_name = %tool_name,
                            error = %e,
                            "Tool call failed"
                        );
                        format!("Error: {e}")
                    }
                };

                message_json.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call.id,
                    "content": content
                }));
            }
        }

        tracing::error!(
            request_id = %request_id,
            max_steps = self.max_steps,
            "Agent exceeded the step ceiling"
        );
        Err(AgentError::StepCeiling {
            steps: self.max_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::Stream;

    use crate::llm::LlmDriver;

    /// Driver that replays one scripted event batch per `stream` call.
    struct ScriptedDriver {
        rounds: Mutex<Vec<Vec<StreamEvent>>>,
    }

    impl ScriptedDriver {
        fn new(rounds: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
            }
        }
    }

    #[async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn stream(
            &self,
            _req: LlmRequest,
        ) -> anyhow::Result<
            std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>,
        > {
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.is_empty() {
                anyhow::bail!("scripted driver ran out of rounds");
            }
            let events = rounds.remove(0);
            Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok).collect::<Vec<_>>(),
            )))
        }
    }

    #[derive(Debug)]
    struct RecordingBackend {
        calls: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolBackend for RecordingBackend {
        fn connection_id(&self) -> &str {
            "test-conn"
        }

        fn tools_json(&self) -> Vec<serde_json::Value> {
            vec![serde_json::json!({
                "type": "function",
                "function": { "name": "calculate_uptime", "parameters": {} }
            })]
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(serde_json::json!({ "content": "Uptime for the last 30 days: 99.9%" }))
        }
    }

    fn text_round(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageDelta {
                text: text.to_string(),
            },
            StreamEvent::Done,
        ]
    }

    fn tool_round() -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallDelta {
                call_index: 0,
                id: Some("call_1".to_string()),
                name: Some("calculate_uptime".to_string()),
                arguments_delta: Some(r#"{"days":30}"#.to_string()),
            },
            StreamEvent::ToolCallComplete {
                call_index: 0,
                id: "call_1".to_string(),
                name: "calculate_uptime".to_string(),
                arguments_json: r#"{"days":30}"#.to_string(),
            },
            StreamEvent::Done,
        ]
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let driver = Arc::new(ScriptedDriver::new(vec![text_round("hello there")]));
        let backend = Arc::new(RecordingBackend::new());
        let agent = Agent::new(driver, backend.clone(), "gpt-4o", 10);

        let result = agent.run(vec![Message::user("hi")]).await.unwrap();
        assert_eq!(result, "hello there");
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            tool_round(),
            text_round("uptime is 99.9%"),
        ]));
        let backend = Arc::new(RecordingBackend::new());
        let agent = Agent::new(driver, backend.clone(), "gpt-4o", 10);

        let result = agent.run(vec![Message::user("uptime?")]).await.unwrap();
        assert_eq!(result, "uptime is 99.9%");

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "calculate_uptime");
        assert_eq!(calls[0].1, serde_json::json!({"days": 30}));
    }

    #[tokio::test]
    async fn test_step_ceiling_is_structured() {
        // Every round asks for tools, so a ceiling of 2 must trip.
        let driver = Arc::new(ScriptedDriver::new(vec![tool_round(), tool_round()]));
        let backend = Arc::new(RecordingBackend::new());
        let agent = Agent::new(driver, backend, "gpt-4o", 2);

        let err = agent.run(vec![Message::user("loop")]).await.unwrap_err();
        assert!(matches!(err, AgentError::StepCeiling { steps: 2 }));
    }

    #[tokio::test]
    async fn test_driver_failure_propagates() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let backend = Arc::new(RecordingBackend::new());
        let agent = Agent::new(driver, backend, "gpt-4o", 10);

        let err = agent.run(vec![Message::user("hi")]).await.unwrap_err();
        match err {
            AgentError::Driver(e) => {
                assert!(e.to_string().contains("ran out of rounds"));
            }
            other => panic!("expected driver error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_failure_fed_back_not_raised() {
        #[derive(Debug)]
        struct FailingBackend;

        #[async_trait]
        impl ToolBackend for FailingBackend {
            fn connection_id(&self) -> &str {
                "failing"
            }
            fn tools_json(&self) -> Vec<serde_json::Value> {
                Vec::new()
            }
            async fn call_tool(
                &self,
                _name: &str,
                _arguments: serde_json::Value,
            ) -> anyhow::Result<serde_json::Value> {
                anyhow::bail!("tool exploded")
            }
        }

        let driver = Arc::new(ScriptedDriver::new(vec![
            tool_round(),
            text_round("recovered"),
        ]));
        let agent = Agent::new(driver, Arc::new(FailingBackend), "gpt-4o", 10);

        let result = agent.run(vec![Message::user("hi")]).await.unwrap();
        assert_eq!(result, "recovered");
    }
}
