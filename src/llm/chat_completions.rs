//! OpenAI Chat Completions API driver.
//!
//! Implements [`LlmDriver`] for `/v1/chat/completions`, streaming responses
//! and tool calls. The request body carries the per-request model; the
//! configured credential rides as a bearer token.

use std::collections::BTreeMap;

use futures::StreamExt;

use super::{LlmDriver, LlmRequest, LlmSettings, StreamEvent};

/// Accumulated state for a streaming tool call.
#[derive(Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("base_url", &self.settings.base_url)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(
        &self,
        req: LlmRequest,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn futures::Stream<Item = anyhow::Result<StreamEvent>> + Send>>>
    {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": req.model,
            "stream": true,
            "messages": req.messages,
            "tools": if req.tools.is_empty() { serde_json::Value::Null } else { serde_json::Value::Array(req.tools) }
        });

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?.error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut accum: BTreeMap<usize, ToolAccum> = BTreeMap::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = find_double_newline(&buf) {
                    let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for line in text.lines() {
                        let line = line.trim();
                        if !line.starts_with("data:") {
                            continue;
                        }
                        let data = line.trim_start_matches("data:").trim();

                        for event in parse_payload(data, &mut accum)? {
                            yield event;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Translate one `data:` payload into zero or more [`StreamEvent`]s,
/// threading tool-call fragments through `accum` until the chunk that
/// carries `finish_reason: "tool_calls"`.
fn parse_payload(
    data: &str,
    accum: &mut BTreeMap<usize, ToolAccum>,
) -> anyhow::Result<Vec<StreamEvent>> {
    if data == "[DONE]" {
        return Ok(vec![StreamEvent::Done]);
    }

    let v: serde_json::Value = serde_json::from_str(data)?;
    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    let mut events = Vec::new();

    if let Some(s) = delta.get("content").and_then(|x| x.as_str()) {
        if !s.is_empty() {
            events.push(StreamEvent::MessageDelta {
                text: s.to_string(),
            });
        }
    }

    if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
        for tc in arr {
            let idx = tc.get("index").and_then(|x| x.as_u64()).unwrap_or(0) as usize;
            let id = tc.get("id").and_then(|x| x.as_str()).map(ToString::to_string);
            let name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|x| x.as_str())
                .map(ToString::to_string);
            let args_delta = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|x| x.as_str())
                .map(ToString::to_string);

            let entry = accum.entry(idx).or_default();
            if entry.id.is_none() {
                entry.id.clone_from(&id);
            }
            if entry.name.is_none() {
                entry.name.clone_from(&name);
            }
            if let Some(ad) = &args_delta {
                entry.args.push_str(ad);
            }

            events.push(StreamEvent::ToolCallDelta {
                call_index: idx,
                id,
                name,
                arguments_delta: args_delta,
            });
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|x| x.as_str()) {
        if fr == "tool_calls" {
            for (idx, a) in accum.iter() {
                if let (Some(id), Some(name)) = (&a.id, &a.name) {
                    events.push(StreamEvent::ToolCallComplete {
                        call_index: *idx,
                        id: id.clone(),
                        name: name.clone(),
                        arguments_json: a.args.clone(),
                    });
                }
            }
        }
    }

    Ok(events)
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
