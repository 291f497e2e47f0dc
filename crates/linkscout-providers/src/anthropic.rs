//! Anthropic Messages API provider.
//!
//! Implements streaming chat completions via `POST /v1/messages` with
//! `stream: true`, including tool use.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use linkscout_core::session::TranscriptEntry;
use linkscout_core::types::ContentBlock;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider,
    ModelApi, ModelInfo, ToolDefinition, ToolUseChunk,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credentials: &Credentials,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match credentials {
            Credentials::ApiKey { api_key } => builder.header("x-api-key", api_key),
            Credentials::OAuth { access_token } => {
                builder.header("authorization", format!("Bearer {access_token}"))
            }
        }
    }
}

// --- Anthropic request/response types ---

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: &'a [serde_json::Value],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
}

/// One decoded streaming event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Accumulates a tool_use block across `input_json_delta` events.
#[derive(Debug, Clone)]
struct ToolUseAccumulator {
    id: String,
    name: String,
    input_json: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Tracks open tool_use blocks by content index.
#[derive(Debug, Default)]
struct BlockTracker {
    tool_uses: HashMap<usize, ToolUseAccumulator>,
}

impl BlockTracker {
    /// Fold one event into the tracker, returning the chunk to emit (if any).
    fn apply(&mut self, event: StreamEvent) -> anyhow::Result<Option<CompletionChunk>> {
        let chunk = match event {
            StreamEvent::MessageStart { message } => message.usage.map(|u| CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                }),
                ..Default::default()
            }),
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                BlockStart::ToolUse { id, name } => {
                    self.tool_uses.insert(
                        index,
                        ToolUseAccumulator {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                    None
                }
                BlockStart::Text { text } if !text.is_empty() => Some(CompletionChunk {
                    delta: Some(text),
                    ..Default::default()
                }),
                BlockStart::Text { .. } | BlockStart::Other => None,
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => Some(CompletionChunk {
                    delta: Some(text),
                    ..Default::default()
                }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    match self.tool_uses.get_mut(&index) {
                        Some(acc) => acc.input_json.push_str(&partial_json),
                        None => warn!(index, "input_json_delta for unknown block"),
                    }
                    None
                }
                BlockDelta::Other => None,
            },
            StreamEvent::ContentBlockStop { index } => {
                self.tool_uses.remove(&index).map(|acc| CompletionChunk {
                    tool_use: Some(ToolUseChunk {
                        id: acc.id,
                        name: acc.name,
                        input_json: if acc.input_json.trim().is_empty() {
                            "{}".into()
                        } else {
                            acc.input_json
                        },
                    }),
                    ..Default::default()
                })
            }
            StreamEvent::MessageDelta { delta, usage } => Some(CompletionChunk {
                usage: usage.map(|u| ChunkUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                }),
                stop_reason: delta.stop_reason,
                ..Default::default()
            }),
            StreamEvent::MessageStop | StreamEvent::Ping => None,
            StreamEvent::Error { error } => {
                anyhow::bail!("Anthropic stream error ({}): {}", error.kind, error.message)
            }
        };
        Ok(chunk)
    }
}

struct AnthropicChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    tracker: BlockTracker,
}

/// Turn an SSE event stream into completion chunks.
fn chunk_stream<S>(sse: S) -> ChunkStream
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    let stream = futures::stream::unfold(
        AnthropicChunkState {
            sse: Box::pin(sse),
            tracker: BlockTracker::default(),
        },
        |mut state| async move {
            loop {
                let sse_event = match state.sse.next().await? {
                    Ok(e) => e,
                    Err(e) => return Some((Err(e), state)),
                };

                let event: StreamEvent = match serde_json::from_str(&sse_event.data) {
                    Ok(ev) => ev,
                    Err(e) => {
                        trace!(%e, data = %sse_event.data, "Skipping unrecognised Anthropic event");
                        continue;
                    }
                };

                match state.tracker.apply(event) {
                    Ok(Some(chunk)) => return Some((Ok(chunk), state)),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), state)),
                }
            }
        },
    );
    Box::pin(stream)
}

/// Convert a single content block to its Anthropic JSON form.
fn content_block_to_json(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn api(&self) -> ModelApi {
        ModelApi::AnthropicMessages
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect()
    }

    fn format_messages(&self, transcript: &[TranscriptEntry]) -> Vec<serde_json::Value> {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        // Tool results answering the same assistant turn share one user message.
        let mut pending_results: Vec<serde_json::Value> = Vec::new();

        let flush = |messages: &mut Vec<serde_json::Value>, pending: &mut Vec<serde_json::Value>| {
            if !pending.is_empty() {
                messages.push(json!({
                    "role": "user",
                    "content": std::mem::take(pending),
                }));
            }
        };

        for entry in transcript {
            match entry {
                TranscriptEntry::User { content, .. } => {
                    flush(&mut messages, &mut pending_results);
                    let blocks: Vec<serde_json::Value> =
                        content.iter().map(content_block_to_json).collect();
                    messages.push(json!({
                        "role": "user",
                        "content": blocks,
                    }));
                }
                TranscriptEntry::Assistant { content, .. } => {
                    flush(&mut messages, &mut pending_results);
                    let blocks: Vec<serde_json::Value> =
                        content.iter().map(content_block_to_json).collect();
                    if !blocks.is_empty() {
                        messages.push(json!({
                            "role": "assistant",
                            "content": blocks,
                        }));
                    }
                }
                TranscriptEntry::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    ..
                } => {
                    pending_results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }));
                }
                // ToolCall entries are already embedded in Assistant content blocks.
                TranscriptEntry::ToolCall { .. } | TranscriptEntry::System { .. } => {}
            }
        }
        flush(&mut messages, &mut pending_results);

        messages
    }

    fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
        stop_reason == "tool_use"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let body = MessagesRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: true,
            system: request.system.as_deref(),
            temperature: request.temperature,
            tools: request.tools.as_deref(),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming Anthropic Messages API");

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json");
        let response = self.authorize(builder, credentials).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {status}: {body}");
        }

        Ok(chunk_stream(parse_sse_stream(response)))
    }

    async fn list_models(&self, credentials: &Credentials) -> anyhow::Result<Vec<ModelInfo>> {
        let builder = self.client.get(format!("{}/v1/models", self.base_url));
        let response = self.authorize(builder, credentials).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to list models {status}: {body}");
        }

        let body: ModelsResponse = response.json().await?;
        Ok(body
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                api: ModelApi::AnthropicMessages,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sse(events: &[&str]) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send + 'static {
        let owned: Vec<anyhow::Result<SseEvent>> = events
            .iter()
            .map(|data| {
                Ok(SseEvent {
                    event: None,
                    data: data.to_string(),
                    id: None,
                })
            })
            .collect();
        futures::stream::iter(owned)
    }

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new(None);
        assert_eq!(provider.id(), "anthropic");
        assert_eq!(provider.api(), ModelApi::AnthropicMessages);
        assert_eq!(provider.base_url, ANTHROPIC_BASE_URL);

        let custom = AnthropicProvider::new(Some("http://127.0.0.1:9999/"));
        assert_eq!(custom.base_url, "http://127.0.0.1:9999");
    }

    #[test]
    fn test_format_tools_uses_input_schema() {
        let provider = AnthropicProvider::new(None);
        let tools = vec![ToolDefinition {
            name: "browser_navigate".into(),
            description: "Navigate to a URL".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"],
            }),
        }];
        let formatted = provider.format_tools(&tools);
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0]["name"], "browser_navigate");
        assert_eq!(formatted[0]["input_schema"]["required"][0], "url");
        assert!(formatted[0].get("parameters").is_none());
    }

    #[test]
    fn test_is_tool_use_stop() {
        let provider = AnthropicProvider::new(None);
        assert!(provider.is_tool_use_stop("tool_use"));
        assert!(!provider.is_tool_use_stop("end_turn"));
        assert!(!provider.is_tool_use_stop("tool_calls"));
    }

    #[test]
    fn test_format_messages_merges_parallel_tool_results() {
        let provider = AnthropicProvider::new(None);
        let transcript = vec![
            TranscriptEntry::user_text("Find the links"),
            TranscriptEntry::Assistant {
                content: vec![
                    ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "browser_navigate".into(),
                        input: json!({"url": "https://example.com"}),
                    },
                    ContentBlock::ToolUse {
                        id: "toolu_2".into(),
                        name: "browser_snapshot".into(),
                        input: json!({}),
                    },
                ],
                usage: None,
                timestamp: Utc::now(),
            },
            TranscriptEntry::ToolCall {
                tool: "browser_navigate".into(),
                params: json!({"url": "https://example.com"}),
                timestamp: Utc::now(),
            },
            TranscriptEntry::ToolResult {
                tool_use_id: "toolu_1".into(),
                tool: "browser_navigate".into(),
                content: "navigated".into(),
                is_error: false,
                timestamp: Utc::now(),
            },
            TranscriptEntry::ToolResult {
                tool_use_id: "toolu_2".into(),
                tool: "browser_snapshot".into(),
                content: "Error: timeout".into(),
                is_error: true,
                timestamp: Utc::now(),
            },
        ];

        let messages = provider.format_messages(&transcript);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "toolu_1");
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn test_event_deserialization() {
        let ev: StreamEvent = serde_json::from_str(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"browser_click","input":{}}}"#,
        )
        .unwrap();
        assert!(matches!(
            ev,
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: BlockStart::ToolUse { .. }
            }
        ));

        let ev: StreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hm"}}"#,
        )
        .unwrap();
        assert!(matches!(
            ev,
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::Other,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_chunk_stream_text_and_tool_use() {
        let events = sse(&[
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Opening page"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"browser_navigate","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"url\": \"https://"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"example.com\"}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":40}}"#,
            r#"{"type":"message_stop"}"#,
        ]);

        let chunks: Vec<CompletionChunk> = chunk_stream(events)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].usage.as_ref().unwrap().input_tokens, Some(12));
        assert_eq!(chunks[1].delta.as_deref(), Some("Opening page"));
        let tool = chunks[2].tool_use.as_ref().unwrap();
        assert_eq!(tool.name, "browser_navigate");
        let input: serde_json::Value = serde_json::from_str(&tool.input_json).unwrap();
        assert_eq!(input["url"], "https://example.com");
        assert_eq!(chunks[3].stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(chunks[3].usage.as_ref().unwrap().output_tokens, Some(40));
    }

    #[tokio::test]
    async fn test_chunk_stream_tool_without_input() {
        let events = sse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"browser_snapshot","input":{}}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
        ]);
        let chunks: Vec<_> = chunk_stream(events).collect().await;
        let tool = chunks[0].as_ref().unwrap().tool_use.clone().unwrap();
        assert_eq!(tool.input_json, "{}");
    }

    #[tokio::test]
    async fn test_chunk_stream_error_event() {
        let events = sse(&[
            r#"{"type":"ping"}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ]);
        let chunks: Vec<_> = chunk_stream(events).collect().await;
        assert_eq!(chunks.len(), 1);
        let err = chunks[0].as_ref().unwrap_err().to_string();
        assert!(err.contains("overloaded_error"));
        assert!(err.contains("Overloaded"));
    }
}
