//! `report_social_links`, the structured final answer for the social-links task.
//!
//! The agent runtime intercepts calls to this tool and ends the run with the
//! call's input. It is never executed against a server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{Tool, ToolContext, ToolOutput};

pub const REPORT_TOOL_NAME: &str = "report_social_links";

/// What the model reports when it calls `report_social_links`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialReport {
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_selector: Option<String>,
}

impl SocialReport {
    /// Parse the tool input, dropping blank and duplicate links while keeping order.
    pub fn from_input(input: &serde_json::Value) -> anyhow::Result<Self> {
        let mut report: SocialReport = serde_json::from_value(input.clone())
            .map_err(|e| anyhow::anyhow!("invalid {REPORT_TOOL_NAME} input: {e}"))?;

        let mut seen = std::collections::HashSet::new();
        report.links = report
            .links
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && seen.insert(l.clone()))
            .collect();
        report.container_selector = report
            .container_selector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(report)
    }
}

pub struct ReportLinksTool;

#[async_trait]
impl Tool for ReportLinksTool {
    fn name(&self) -> &str {
        REPORT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Report the extracted social media links as a structured list, together with the CSS selector of the element that contains them"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "links": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "description": "A social media URL"
                    },
                    "description": "List of social media link URLs"
                },
                "container_selector": {
                    "type": "string",
                    "description": "CSS selector of the element containing the social links"
                }
            },
            "required": ["links"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let report = SocialReport::from_input(&params)?;
        Ok(ToolOutput::text(format!(
            "Recorded {} social links",
            report.links.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_input_normalises() {
        let report = SocialReport::from_input(&json!({
            "links": [
                " https://www.facebook.com/RepIlhan/ ",
                "",
                "https://x.com/Ilhan",
                "https://www.facebook.com/RepIlhan/"
            ],
            "container_selector": "  .evo-social-icons-here "
        }))
        .unwrap();
        assert_eq!(
            report.links,
            vec!["https://www.facebook.com/RepIlhan/", "https://x.com/Ilhan"]
        );
        assert_eq!(
            report.container_selector.as_deref(),
            Some(".evo-social-icons-here")
        );
    }

    #[test]
    fn test_from_input_without_selector() {
        let report = SocialReport::from_input(&json!({"links": []})).unwrap();
        assert!(report.links.is_empty());
        assert!(report.container_selector.is_none());

        let blank = SocialReport::from_input(&json!({"links": [], "container_selector": " "}))
            .unwrap();
        assert!(blank.container_selector.is_none());
    }

    #[test]
    fn test_from_input_rejects_missing_links() {
        let err = SocialReport::from_input(&json!({"urls": ["https://x.com/a"]})).unwrap_err();
        assert!(err.to_string().contains(REPORT_TOOL_NAME));
    }

    #[test]
    fn test_schema_requires_links() {
        let schema = ReportLinksTool.parameters_schema();
        assert_eq!(schema["required"], json!(["links"]));
        assert_eq!(schema["properties"]["links"]["type"], "array");
    }
}
