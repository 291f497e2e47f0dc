//! Subscriber setup from the `logging` config section.

use linkscout_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives: `--verbose` forces debug, otherwise the configured
/// level (default info), followed by per-crate filters.
fn directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config
            .and_then(|c| c.level.as_deref())
            .unwrap_or("info")
    };

    let mut directives = vec![level.to_string()];
    if let Some(config) = config {
        directives.extend(config.filters.iter().cloned());
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` takes precedence over config.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config, verbose)));

    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives() {
        assert_eq!(directives(None, false), "info");
        assert_eq!(directives(None, true), "debug");

        let config = LoggingConfig {
            format: "json".into(),
            level: Some("warn".into()),
            filters: vec!["linkscout_mcp=trace".into()],
            output: "stderr".into(),
        };
        assert_eq!(directives(Some(&config), false), "warn,linkscout_mcp=trace");
        assert_eq!(directives(Some(&config), true), "debug,linkscout_mcp=trace");
    }
}
