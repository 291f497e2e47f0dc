//! The social-links task: drive a browser MCP server until the model reports
//! the page's social media links, then key them by platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use linkscout_core::config::Config;
use linkscout_core::links::group_by_platform;
use linkscout_core::session::Transcript;
use linkscout_mcp::{McpClient, McpError};
use linkscout_providers::{Credentials, LlmProvider};
use linkscout_tools::{ReportLinksTool, SocialReport, ToolRegistry};

use crate::prompt::{social_links_prompt, system_prompt};
use crate::{AgentErrorKind, AgentEvent, AgentOptions, run_agent};

/// What to extract and how.
#[derive(Debug, Clone, Default)]
pub struct SocialLinksTask {
    pub url: String,
    /// Class name expected on the element holding the links.
    pub container_hint: Option<String>,
    /// Overrides the configured model.
    pub model: Option<String>,
    /// Overrides the configured iteration budget.
    pub max_iterations: Option<u32>,
}

impl SocialLinksTask {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn prompt(&self) -> String {
        social_links_prompt(&self.url, self.container_hint.as_deref())
    }
}

/// Outcome of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialLinksReport {
    pub url: String,
    /// Links as reported, deduplicated, in report order.
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_selector: Option<String>,
    /// Platform name → link. A later link for the same platform wins.
    pub platforms: BTreeMap<String, String>,
}

impl SocialLinksReport {
    pub fn from_report(url: impl Into<String>, report: SocialReport) -> Self {
        let platforms = group_by_platform(report.links.as_slice());
        Self {
            url: url.into(),
            links: report.links,
            container_selector: report.container_selector,
            platforms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocialLinksError {
    #[error(
        "failed to list tools from MCP server '{server}': {source}; run `linkscout mcp check {server}` to diagnose"
    )]
    ListTools {
        server: String,
        #[source]
        source: McpError,
    },

    #[error(
        "MCP server '{server}' exposes no tools; run `linkscout mcp check {server}` to diagnose"
    )]
    NoTools { server: String },

    #[error("agent run failed ({kind}): {message}")]
    Agent {
        kind: AgentErrorKind,
        message: String,
        text: Option<String>,
    },

    #[error("agent finished without calling report_social_links{}", reply_suffix(.text))]
    NotReported { text: Option<String> },

    #[error("invalid report: {0}")]
    InvalidReport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn reply_suffix(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

/// Run the social-links task against `client`'s browser tools.
pub async fn extract_social_links(
    task: &SocialLinksTask,
    config: &Config,
    provider: &dyn LlmProvider,
    credentials: &Credentials,
    client: &Arc<McpClient>,
) -> Result<SocialLinksReport, SocialLinksError> {
    let server = client.name().to_string();

    let mut tools = ToolRegistry::new();
    let count = linkscout_tools::register_mcp_tools(&mut tools, client)
        .await
        .map_err(|source| SocialLinksError::ListTools {
            server: server.clone(),
            source,
        })?;
    if count == 0 {
        return Err(SocialLinksError::NoTools { server });
    }
    info!(%server, tools = count, url = %task.url, "Registered MCP tools");

    let mut options = AgentOptions::from_config(config);
    if let Some(model) = &task.model {
        options.model = model.clone();
    }
    if let Some(max_iterations) = task.max_iterations {
        options.max_iterations = max_iterations;
    }
    options.system = Some(system_prompt());
    options.final_answer_tool = Some(linkscout_tools::definition(&ReportLinksTool));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let logger = tokio::spawn(log_events(event_rx));

    let mut transcript = Transcript::new();
    let result = run_agent(
        &mut transcript,
        &task.prompt(),
        &options,
        &tools,
        provider,
        credentials,
        event_tx,
    )
    .await;
    let _ = logger.await;
    let result = result?;

    info!(
        iterations = result.meta.iterations,
        tool_calls = result.meta.tool_calls,
        input_tokens = result.meta.input_tokens,
        output_tokens = result.meta.output_tokens,
        duration_ms = result.meta.duration_ms,
        "Agent run complete"
    );

    if let Some(error) = result.meta.error {
        return Err(SocialLinksError::Agent {
            kind: error.kind,
            message: error.message,
            text: result.text,
        });
    }

    let Some(input) = result.final_answer else {
        return Err(SocialLinksError::NotReported { text: result.text });
    };
    let report =
        SocialReport::from_input(&input).map_err(|e| SocialLinksError::InvalidReport(e.to_string()))?;

    Ok(SocialLinksReport::from_report(&task.url, report))
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::ToolCall { tool, params } => info!(%tool, %params, "Tool call"),
            AgentEvent::ToolResult {
                tool,
                content,
                is_error,
            } => {
                if is_error {
                    warn!(%tool, %content, "Tool returned an error");
                } else {
                    debug!(%tool, bytes = content.len(), "Tool result");
                }
            }
            AgentEvent::BlockReply { text, .. } => debug!(%text, "Assistant reply"),
            AgentEvent::FinalAnswer { tool, input } => debug!(%tool, %input, "Final answer"),
            AgentEvent::Usage {
                input_tokens,
                output_tokens,
            } => debug!(input_tokens, output_tokens, "Usage"),
            AgentEvent::Error { kind, message } => warn!(%kind, %message, "Agent error"),
            AgentEvent::PartialReply { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_keys_platforms() {
        let report = SocialReport::from_input(&json!({
            "links": [
                "https://www.facebook.com/RepIlhan/",
                "https://instagram.com/repilhan",
                "https://x.com/Ilhan",
                "https://twitter.com/IlhanMN"
            ],
            "container_selector": ".evo-social-icons-here"
        }))
        .unwrap();
        let out = SocialLinksReport::from_report("https://omar.house.gov/", report);

        assert_eq!(out.links.len(), 4);
        assert_eq!(out.platforms.len(), 4);
        assert_eq!(out.platforms["facebook"], "https://www.facebook.com/RepIlhan/");
        assert_eq!(out.platforms["x"], "https://x.com/Ilhan");
        assert_eq!(out.platforms["twitter"], "https://twitter.com/IlhanMN");
        assert_eq!(out.container_selector.as_deref(), Some(".evo-social-icons-here"));
    }

    #[test]
    fn test_error_messages_point_at_mcp_check() {
        let err = SocialLinksError::NoTools {
            server: "playwright".into(),
        };
        assert!(err.to_string().contains("linkscout mcp check playwright"));

        let err = SocialLinksError::NotReported {
            text: Some("I could not find any links.".into()),
        };
        assert_eq!(
            err.to_string(),
            "agent finished without calling report_social_links: I could not find any links."
        );
        let err = SocialLinksError::NotReported { text: None };
        assert_eq!(
            err.to_string(),
            "agent finished without calling report_social_links"
        );
    }

    #[test]
    fn test_task_prompt_uses_hint() {
        let task = SocialLinksTask {
            container_hint: Some("evo-social".into()),
            ..SocialLinksTask::new("https://omar.house.gov/")
        };
        assert!(task.prompt().contains("evo-social"));
        assert!(task.prompt().contains("https://omar.house.gov/"));
    }
}
