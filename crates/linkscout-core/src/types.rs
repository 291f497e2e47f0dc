use serde::{Deserialize, Serialize};

/// A piece of message content recorded in the transcript.
///
/// Tool results are not content blocks here; they are separate
/// [`TranscriptEntry::ToolResult`](crate::session::TranscriptEntry::ToolResult)
/// entries that providers fold into the following user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text of a `Text` block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ToolUse { .. } => None,
        }
    }
}
