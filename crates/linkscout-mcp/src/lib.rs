//! Model Context Protocol client.
//!
//! Speaks newline-delimited JSON-RPC 2.0 to an MCP server, usually a child
//! process spawned from a [`McpServerConfig`](linkscout_core::config::McpServerConfig).
//! Only the tool surface of the protocol is used: `initialize`,
//! `tools/list`, and `tools/call`.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::McpClient;
pub use error::McpError;
pub use protocol::{CallToolResult, InitializeResult, McpTool, ToolContent};
