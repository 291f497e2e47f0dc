//! Agent runtime that drives the LLM through a tool-calling loop.
//!
//! [`run_agent`] streams completions, executes the tool calls the model makes
//! and reports progress as [`AgentEvent`]s. [`extract_social_links`] wires the
//! loop to an MCP browser server for the social-links task.

use serde::{Deserialize, Serialize};

use linkscout_core::config::Config;
use linkscout_providers::ToolDefinition;

pub mod prompt;
pub mod runtime;
pub mod social;

pub use runtime::run_agent;
pub use social::{SocialLinksError, SocialLinksReport, SocialLinksTask, extract_social_links};

/// Events emitted by the agent runtime during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Assistant text that ended the run.
    #[serde(rename = "block_reply")]
    BlockReply { text: String, is_final: bool },

    /// A tool call is being made.
    #[serde(rename = "tool_call")]
    ToolCall {
        tool: String,
        params: serde_json::Value,
    },

    /// A tool call has completed.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool: String,
        content: String,
        is_error: bool,
    },

    /// Streaming text delta.
    #[serde(rename = "partial_reply")]
    PartialReply { delta: String },

    /// Cumulative token usage for the run.
    #[serde(rename = "usage")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// The model called the final-answer tool.
    #[serde(rename = "final_answer")]
    FinalAnswer {
        tool: String,
        input: serde_json::Value,
    },

    /// The run failed.
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

/// Per-run settings.
#[derive(Clone)]
pub struct AgentOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub max_iterations: u32,
    pub system: Option<String>,
    /// Tool that ends the run with its input instead of being executed.
    pub final_answer_tool: Option<ToolDefinition>,
}

impl AgentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.default_model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            max_iterations: config.max_tool_iterations(),
            system: None,
            final_answer_tool: None,
        }
    }
}

/// Result of a completed agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub text: Option<String>,
    /// Input of the final-answer tool call, when the run ended with one.
    pub final_answer: Option<serde_json::Value>,
    pub meta: AgentRunMeta,
}

impl AgentRunResult {
    pub fn is_error(&self) -> bool {
        self.meta.error.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRunMeta {
    pub duration_ms: u64,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u32,
    pub stop_reason: Option<String>,
    pub error: Option<AgentRunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunError {
    pub kind: AgentErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    ProviderError,
    MaxIterations,
    UnexpectedStop,
}

impl AgentErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderError => "provider_error",
            Self::MaxIterations => "max_iterations",
            Self::UnexpectedStop => "unexpected_stop",
        }
    }
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
