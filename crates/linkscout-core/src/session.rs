//! Run transcript model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ContentBlock;

/// A single entry in a run transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TranscriptEntry {
    #[serde(rename = "user")]
    User {
        content: Vec<ContentBlock>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        tool: String,
        params: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "system")]
    System {
        event: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TranscriptEntry {
    /// Plain-text user entry stamped with the current time.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentBlock::text(text)],
            timestamp: Utc::now(),
        }
    }
}

/// Ordered transcript of one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text of the most recent assistant turn that produced any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|entry| match entry {
            TranscriptEntry::Assistant { content, .. } => {
                let text: String = content.iter().filter_map(ContentBlock::as_text).collect();
                (!text.is_empty()).then_some(text)
            }
            _ => None,
        })
    }
}
