//! Adapter exposing MCP server tools through the [`Tool`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use linkscout_mcp::protocol::McpTool as RemoteTool;
use linkscout_mcp::{CallToolResult, McpClient, McpError, ToolContent};

use crate::{Tool, ToolContext, ToolMedia, ToolOutput, ToolRegistry};

/// One tool hosted by an MCP server.
pub struct McpTool {
    client: Arc<McpClient>,
    remote: RemoteTool,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, remote: RemoteTool) -> Self {
        Self { client, remote }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.remote.name
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.remote.input_schema.clone()
    }

    fn description(&self) -> &str {
        self.remote.description.as_deref().unwrap_or("")
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        debug!(
            run_id = %context.run_id,
            server = %self.client.name(),
            tool = %self.remote.name,
            "Calling MCP tool"
        );
        let result = self.client.call_tool(&self.remote.name, params).await?;
        Ok(output_from_result(result))
    }
}

/// Flatten an MCP result: text joined by newlines, images carried as media.
pub fn output_from_result(result: CallToolResult) -> ToolOutput {
    let content = result.text();
    let media: Vec<ToolMedia> = result
        .content
        .into_iter()
        .filter_map(|c| match c {
            ToolContent::Image { data, mime_type } => Some(ToolMedia { mime_type, data }),
            _ => None,
        })
        .collect();

    ToolOutput {
        content,
        is_error: result.is_error,
        media: if media.is_empty() { None } else { Some(media) },
    }
}

/// Register every tool the server lists. Returns how many were registered.
pub async fn register_mcp_tools(
    registry: &mut ToolRegistry,
    client: &Arc<McpClient>,
) -> Result<usize, McpError> {
    let tools = client.list_tools().await?;
    let count = tools.len();
    for remote in tools {
        registry.register(Box::new(McpTool::new(client.clone(), remote)));
    }
    Ok(count)
}
