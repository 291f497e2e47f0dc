//! Prompts for the social-links task.

use linkscout_tools::REPORT_TOOL_NAME;

/// System prompt for browser-driving runs.
pub fn system_prompt() -> String {
    let now = chrono::Utc::now();
    [
        "You are a careful web research assistant that operates a real browser through the tools you are given.".to_string(),
        "Prefer page snapshots over screenshots when reading a page, and only act on elements you have seen in a snapshot.".to_string(),
        format!("When the task asks for a result, deliver it by calling the `{REPORT_TOOL_NAME}` tool instead of replying in prose."),
        format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S UTC")),
    ]
    .join("\n\n")
}

/// Task prompt: load `url`, clear popups, find the social links and report them.
///
/// `container_hint` is a class name (or fragment of one) the caller expects on
/// the element that holds the links.
pub fn social_links_prompt(url: &str, container_hint: Option<&str>) -> String {
    let locate = match container_hint.map(str::trim).filter(|h| !h.is_empty()) {
        Some(hint) => format!(
            "Find the element that contains the social media links. It most likely has a class containing \"{hint}\"; if no such element exists, find the container another way"
        ),
        None => "Find the element that contains the social media links (look for links to Facebook, Twitter/X, Instagram, YouTube, etc.)".to_string(),
    };

    format!(
        "Please use the browser tools to complete the following task:

1. Navigate to {url}
2. Wait for the page to load
3. Close any popups that appear (like newsletter signups, cookie notices, etc.)
4. {locate}
5. Extract all the social media link URLs inside that element
6. Use the \"{REPORT_TOOL_NAME}\" tool to return the list of URLs together with the CSS selector of the containing element

Make sure to extract all social media links you can find on the page.
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_without_hint() {
        let prompt = social_links_prompt("https://crawford.house.gov/", None);
        assert!(prompt.contains("1. Navigate to https://crawford.house.gov/"));
        assert!(prompt.contains("cookie notices"));
        assert!(prompt.contains("Twitter/X"));
        assert!(prompt.contains("\"report_social_links\""));
        assert!(!prompt.contains("class containing"));
    }

    #[test]
    fn test_prompt_with_hint() {
        let prompt = social_links_prompt("https://omar.house.gov/", Some(" evo-social "));
        assert!(prompt.contains("class containing \"evo-social\""));
        assert!(prompt.contains("CSS selector"));

        let blank = social_links_prompt("https://omar.house.gov/", Some("  "));
        assert!(!blank.contains("class containing"));
    }

    #[test]
    fn test_system_prompt_names_report_tool() {
        let prompt = system_prompt();
        assert!(prompt.contains(REPORT_TOOL_NAME));
        assert!(prompt.contains("Current time:"));
    }
}
