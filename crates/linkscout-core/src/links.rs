//! Social link normalisation.
//!
//! Links arrive exactly as the LLM reported them. These helpers key them by
//! the platform their host belongs to.

use std::collections::BTreeMap;

use tracing::warn;
use url::Url;

/// Derive the platform name from a link's host.
///
/// `https://www.facebook.com/RepIlhan/` → `facebook`, `https://x.com/Ilhan` → `x`.
/// Links without a scheme are read as `https://`.
pub fn platform_name(link: &str) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }

    let parsed = match Url::parse(link) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{link}")).ok()?
        }
        Err(_) => return None,
    };

    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let platform = host.split('.').next()?;

    if platform.is_empty() {
        None
    } else {
        Some(platform.to_string())
    }
}

/// Key links by platform. A later link for the same platform replaces an earlier one.
pub fn group_by_platform<S: AsRef<str>>(links: &[S]) -> BTreeMap<String, String> {
    let mut grouped = BTreeMap::new();
    for link in links {
        let link = link.as_ref();
        match platform_name(link) {
            Some(platform) => {
                grouped.insert(platform, link.trim().to_string());
            }
            None => warn!(link, "Skipping link without a recognisable host"),
        }
    }
    grouped
}
