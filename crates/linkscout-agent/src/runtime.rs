//! Agent runtime loop: LLM streaming plus tool calling.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use linkscout_core::session::{Transcript, TranscriptEntry, Usage};
use linkscout_core::types::ContentBlock;
use linkscout_providers::{CompletionRequest, Credentials, LlmProvider};
use linkscout_tools::{ToolContext, ToolOutput, ToolRegistry};

use crate::{AgentErrorKind, AgentEvent, AgentOptions, AgentRunError, AgentRunMeta, AgentRunResult};

/// Counters accumulated over one run.
struct RunState {
    start: Instant,
    iterations: u32,
    input_tokens: u64,
    output_tokens: u64,
    tool_calls: u32,
}

impl RunState {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            iterations: 0,
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: 0,
        }
    }

    fn finish(
        &self,
        text: Option<String>,
        final_answer: Option<serde_json::Value>,
        stop_reason: Option<String>,
        error: Option<AgentRunError>,
    ) -> AgentRunResult {
        AgentRunResult {
            text,
            final_answer,
            meta: AgentRunMeta {
                duration_ms: self.start.elapsed().as_millis() as u64,
                iterations: self.iterations,
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                tool_calls: self.tool_calls,
                stop_reason,
                error,
            },
        }
    }

    fn fail(
        &self,
        event_tx: &mpsc::UnboundedSender<AgentEvent>,
        kind: AgentErrorKind,
        message: String,
        stop_reason: Option<String>,
        text: Option<String>,
    ) -> AgentRunResult {
        let _ = event_tx.send(AgentEvent::Error {
            kind: kind.as_str().into(),
            message: message.clone(),
        });
        self.finish(
            text,
            None,
            stop_reason,
            Some(AgentRunError { kind, message }),
        )
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

/// Run the agent loop: stream LLM, execute tools, emit events.
///
/// Failures are reported through [`AgentRunResult::meta`]; the returned
/// `Err` is reserved for problems outside the run itself.
pub async fn run_agent(
    transcript: &mut Transcript,
    message: &str,
    options: &AgentOptions,
    tools: &ToolRegistry,
    provider: &dyn LlmProvider,
    credentials: &Credentials,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
) -> anyhow::Result<AgentRunResult> {
    let mut state = RunState::new();
    let run_id = Uuid::new_v4().to_string();
    info!(
        %run_id,
        model = %options.model,
        max_iterations = options.max_iterations,
        tools = tools.list().len(),
        "Starting agent run"
    );

    transcript.append(TranscriptEntry::user_text(message));

    let final_tool = options.final_answer_tool.as_ref().map(|t| t.name.as_str());
    let mut definitions = tools.definitions();
    if let Some(tool) = &options.final_answer_tool {
        definitions.retain(|d| d.name != tool.name);
        definitions.push(tool.clone());
    }
    let tool_defs = if definitions.is_empty() {
        None
    } else {
        Some(provider.format_tools(&definitions))
    };

    let tool_context = ToolContext {
        run_id: run_id.clone(),
    };

    while state.iterations < options.max_iterations {
        state.iterations += 1;
        debug!(%run_id, iteration = state.iterations, "Agent loop iteration");

        let request = CompletionRequest {
            model: options.model.clone(),
            messages: provider.format_messages(&transcript.entries),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools: tool_defs.clone(),
            system: options.system.clone(),
        };

        let mut stream = match provider.stream(&request, credentials).await {
            Ok(s) => s,
            Err(e) => {
                error!(%e, "Provider stream error");
                return Ok(state.fail(
                    &event_tx,
                    AgentErrorKind::ProviderError,
                    e.to_string(),
                    None,
                    None,
                ));
            }
        };

        let mut response_text = String::new();
        let mut tool_uses: Vec<(String, String, serde_json::Value)> = Vec::new(); // (id, name, input)
        let mut stop_reason: Option<String> = None;
        let mut usage = Usage::default();

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(%e, "Stream chunk error");
                    state.input_tokens += usage.input_tokens;
                    state.output_tokens += usage.output_tokens;
                    return Ok(state.fail(
                        &event_tx,
                        AgentErrorKind::ProviderError,
                        e.to_string(),
                        None,
                        non_empty(response_text),
                    ));
                }
            };

            if let Some(delta) = chunk.delta {
                response_text.push_str(&delta);
                let _ = event_tx.send(AgentEvent::PartialReply { delta });
            }

            if let Some(tool_use) = chunk.tool_use {
                let input = match serde_json::from_str(&tool_use.input_json) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(%e, tool = %tool_use.name, "Malformed tool input, using {{}}");
                        json!({})
                    }
                };
                tool_uses.push((tool_use.id, tool_use.name, input));
            }

            // Usage figures are cumulative within one response.
            if let Some(chunk_usage) = chunk.usage {
                if let Some(inp) = chunk_usage.input_tokens {
                    usage.input_tokens = inp;
                }
                if let Some(out) = chunk_usage.output_tokens {
                    usage.output_tokens = out;
                }
            }

            if let Some(reason) = chunk.stop_reason {
                stop_reason = Some(reason);
            }
        }

        state.input_tokens += usage.input_tokens;
        state.output_tokens += usage.output_tokens;

        let mut assistant_content: Vec<ContentBlock> = Vec::new();
        if !response_text.is_empty() {
            assistant_content.push(ContentBlock::text(response_text.clone()));
        }
        for (id, name, input) in &tool_uses {
            assistant_content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
        }
        transcript.append(TranscriptEntry::Assistant {
            content: assistant_content,
            usage: Some(usage),
            timestamp: Utc::now(),
        });

        let _ = event_tx.send(AgentEvent::Usage {
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
        });

        let is_tool_use = stop_reason
            .as_deref()
            .is_some_and(|r| provider.is_tool_use_stop(r));

        if is_tool_use && !tool_uses.is_empty() {
            for (id, name, input) in tool_uses {
                if final_tool == Some(name.as_str()) {
                    info!(
                        %run_id,
                        tool = %name,
                        iterations = state.iterations,
                        "Final answer received"
                    );
                    let _ = event_tx.send(AgentEvent::FinalAnswer {
                        tool: name,
                        input: input.clone(),
                    });
                    return Ok(state.finish(
                        non_empty(response_text),
                        Some(input),
                        stop_reason,
                        None,
                    ));
                }

                state.tool_calls += 1;
                info!(tool = %name, "Executing tool");
                let _ = event_tx.send(AgentEvent::ToolCall {
                    tool: name.clone(),
                    params: input.clone(),
                });

                transcript.append(TranscriptEntry::ToolCall {
                    tool: name.clone(),
                    params: input.clone(),
                    timestamp: Utc::now(),
                });

                let tool_output = match tools.get(&name) {
                    Some(tool) => match tool.execute(input, &tool_context).await {
                        Ok(output) => output,
                        Err(e) => {
                            warn!(%e, tool = %name, "Tool execution error");
                            ToolOutput::error(format!("Error: {e}"))
                        }
                    },
                    None => {
                        warn!(tool = %name, "Model called an unknown tool");
                        ToolOutput::error(format!("Error: Unknown tool: {name}"))
                    }
                };

                let _ = event_tx.send(AgentEvent::ToolResult {
                    tool: name.clone(),
                    content: tool_output.content.clone(),
                    is_error: tool_output.is_error,
                });

                transcript.append(TranscriptEntry::ToolResult {
                    tool_use_id: id,
                    tool: name,
                    content: tool_output.content,
                    is_error: tool_output.is_error,
                    timestamp: Utc::now(),
                });
            }

            // The next iteration sends the tool results back
            continue;
        }

        match stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => {
                info!(%run_id, iterations = state.iterations, "Agent finished");
                let _ = event_tx.send(AgentEvent::BlockReply {
                    text: response_text.clone(),
                    is_final: true,
                });
                return Ok(state.finish(
                    non_empty(response_text),
                    None,
                    stop_reason.clone(),
                    None,
                ));
            }
            other => {
                let message = match other {
                    Some(reason) => format!("Unexpected stop reason: {reason}"),
                    None => "Response ended without a stop reason".to_string(),
                };
                warn!(%run_id, %message, "Agent stopped");
                return Ok(state.fail(
                    &event_tx,
                    AgentErrorKind::UnexpectedStop,
                    message,
                    stop_reason.clone(),
                    non_empty(response_text),
                ));
            }
        }
    }

    warn!(%run_id, max_iterations = options.max_iterations, "Iteration budget exhausted");
    Ok(state.fail(
        &event_tx,
        AgentErrorKind::MaxIterations,
        "Maximum iterations reached without completion".into(),
        None,
        transcript.last_assistant_text(),
    ))
}
