//! Configuration loading, validation, and MCP server registrations.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LinkscoutError, Result};

/// Placeholder value shipped in sample env files; never a real key.
pub const API_KEY_PLACEHOLDER: &str = "your_api_key_here";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 15;
pub const DEFAULT_MCP_SERVER: &str = "playwright";

/// Top-level linkscout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<AgentsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<AgentDefaults>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,
}

// --- Typed provider config ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).filter(|k| is_usable_api_key(k))
    }
}

// --- MCP server registrations ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Server used when a command does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_server: Option<String>,

    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// A stdio MCP server the client can spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Per-request timeout in ms (default: 120000).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    120_000
}

impl McpServerConfig {
    /// The Playwright MCP server launched through `npx`.
    pub fn playwright() -> Self {
        Self {
            name: DEFAULT_MCP_SERVER.into(),
            command: "npx".into(),
            args: vec!["@playwright/mcp@latest".into()],
            env: BTreeMap::new(),
            cwd: None,
            request_timeout_ms: default_request_timeout(),
        }
    }

    /// Working directory with `~` expanded.
    pub fn resolved_cwd(&self) -> Option<PathBuf> {
        self.cwd
            .as_ref()
            .map(|c| PathBuf::from(shellexpand::tilde(c).as_ref()))
    }

    /// Human-readable command line for logs and listings.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "linkscout_mcp=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// A key is usable when it is non-empty and not the sample placeholder.
pub fn is_usable_api_key(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && key != API_KEY_PLACEHOLDER
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        Self::read(path, true)
    }

    /// Load config with `${ENV_VAR}` references left as written.
    ///
    /// Use this when the config will be saved back, so resolved secrets never
    /// reach the file.
    pub fn load_unresolved(path: &Path) -> Result<Self> {
        Self::read(path, false)
    }

    fn read(path: &Path, substitute: bool) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(LinkscoutError::io(path))?;

        // Substitute ${ENV_VAR} references before parsing
        let text = if substitute {
            substitute_env_vars(&raw)
        } else {
            raw
        };

        let config: Config = json5::from_str(&text).map_err(|e| LinkscoutError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Save config to a file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(LinkscoutError::io(parent))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(LinkscoutError::io(path))?;
        Ok(())
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    fn agent_defaults(&self) -> Option<&AgentDefaults> {
        self.agents.as_ref().and_then(|a| a.defaults.as_ref())
    }

    /// Model to use: agent default, then the anthropic provider default.
    pub fn default_model(&self) -> String {
        self.agent_defaults()
            .and_then(|d| d.model.clone())
            .or_else(|| self.provider("anthropic").and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Get the default max_tokens.
    pub fn max_tokens(&self) -> u32 {
        self.agent_defaults()
            .and_then(|d| d.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// Get the max tool iterations.
    pub fn max_tool_iterations(&self) -> u32 {
        self.agent_defaults()
            .and_then(|d| d.max_tool_iterations)
            .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS)
    }

    /// Get temperature setting.
    pub fn temperature(&self) -> Option<f64> {
        self.agent_defaults().and_then(|d| d.temperature)
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    /// Anthropic API key from config, falling back to `ANTHROPIC_API_KEY`.
    pub fn anthropic_api_key(&self) -> Option<String> {
        self.provider("anthropic")
            .and_then(|p| p.resolve_api_key())
            .or_else(|| {
                resolve_secret_field(&None, &Some("ANTHROPIC_API_KEY".into()))
                    .filter(|k| is_usable_api_key(k))
            })
    }

    /// Configured MCP servers, or the built-in Playwright server when none are registered.
    pub fn mcp_servers(&self) -> Vec<McpServerConfig> {
        match self.mcp.as_ref().map(|m| &m.servers) {
            Some(servers) if !servers.is_empty() => servers.clone(),
            _ => vec![McpServerConfig::playwright()],
        }
    }

    /// Look up a server by name, or the default server when `name` is `None`.
    pub fn mcp_server(&self, name: Option<&str>) -> Option<McpServerConfig> {
        let servers = self.mcp_servers();
        let wanted = name
            .map(str::to_string)
            .or_else(|| self.mcp.as_ref().and_then(|m| m.default_server.clone()));
        match wanted {
            Some(wanted) => servers.into_iter().find(|s| s.name == wanted),
            None => servers.into_iter().next(),
        }
    }

    /// Register a server, replacing any existing registration with the same name.
    /// Returns `true` when an existing entry was replaced.
    pub fn add_mcp_server(&mut self, server: McpServerConfig) -> bool {
        let mcp = self.mcp.get_or_insert_with(McpConfig::default);
        match mcp.servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => {
                *existing = server;
                true
            }
            None => {
                mcp.servers.push(server);
                false
            }
        }
    }

    /// Remove a server registration. Returns the removed entry.
    pub fn remove_mcp_server(&mut self, name: &str) -> Option<McpServerConfig> {
        let mcp = self.mcp.as_mut()?;
        let pos = mcp.servers.iter().position(|s| s.name == name)?;
        if mcp.default_server.as_deref() == Some(name) {
            mcp.default_server = None;
        }
        Some(mcp.servers.remove(pos))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(providers) = self.models.as_ref().and_then(|m| m.providers.as_ref()) {
            for p in providers {
                if p.resolve_api_key().is_none() {
                    warnings.push(format!("Provider '{}' has no API key configured", p.id));
                }
            }
        }
        if self.anthropic_api_key().is_none() {
            warnings.push("No Anthropic API key found (set ANTHROPIC_API_KEY)".to_string());
        }

        if let Some(mcp) = &self.mcp {
            let mut seen = HashSet::new();
            for server in &mcp.servers {
                if server.command.trim().is_empty() {
                    errors.push(format!("MCP server '{}' has an empty command", server.name));
                }
                if server.request_timeout_ms == 0 {
                    errors.push(format!("MCP server '{}' has a zero request timeout", server.name));
                }
                if !seen.insert(server.name.as_str()) {
                    errors.push(format!("Duplicate MCP server name '{}'", server.name));
                }
            }
            if let Some(default) = &mcp.default_server {
                if !mcp.servers.is_empty() && !mcp.servers.iter().any(|s| &s.name == default) {
                    errors.push(format!("Default MCP server '{default}' is not registered"));
                }
            }
        }

        (warnings, errors)
    }
}

/// Base directory for linkscout data: `~/.linkscout/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".linkscout")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_LS_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_LS_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_LS_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_LS_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#)); // empty string
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_model(), DEFAULT_MODEL);
        assert_eq!(config.max_tokens(), 4000);
        assert_eq!(config.max_tool_iterations(), 15);
        assert!(config.temperature().is_none());
    }

    #[test]
    fn test_default_mcp_server_is_playwright() {
        let config = Config::default();
        let servers = config.mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "playwright");
        assert_eq!(servers[0].command_line(), "npx @playwright/mcp@latest");
        assert_eq!(config.mcp_server(None).unwrap().name, "playwright");
        assert!(config.mcp_server(Some("missing")).is_none());
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_LS_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "anthropic".into(),
            api_key_env: Some("TEST_LS_API_KEY".into()),
            api_key: None,
            base_url: None,
            default_model: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            api_key: Some("direct-key".into()),
            ..provider.clone()
        };
        // Direct key takes priority
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_LS_API_KEY") };
    }

    #[test]
    fn test_placeholder_key_is_rejected() {
        assert!(!is_usable_api_key(""));
        assert!(!is_usable_api_key("  "));
        assert!(!is_usable_api_key(API_KEY_PLACEHOLDER));
        assert!(is_usable_api_key("sk-ant-123"));

        let provider = ProviderConfig {
            id: "anthropic".into(),
            api_key_env: None,
            api_key: Some(API_KEY_PLACEHOLDER.into()),
            base_url: None,
            default_model: None,
        };
        assert!(provider.resolve_api_key().is_none());
    }

    #[test]
    fn test_load_json5_with_servers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                agents: { defaults: { model: "claude-test", max_tool_iterations: 5 } },
                mcp: {
                    default_server: "local",
                    servers: [
                        { name: "local", command: "node", args: ["server.js"], request_timeout_ms: 500 },
                        { name: "playwright", command: "npx", args: ["@playwright/mcp@latest", "--executable-path", "/usr/bin/chromium"] },
                    ],
                },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.default_model(), "claude-test");
        assert_eq!(config.max_tool_iterations(), 5);
        let default = config.mcp_server(None).unwrap();
        assert_eq!(default.name, "local");
        assert_eq!(default.request_timeout_ms, 500);
        let pw = config.mcp_server(Some("playwright")).unwrap();
        assert_eq!(pw.request_timeout_ms, 120_000);
        assert_eq!(pw.args.len(), 3);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/linkscout/config.json")).unwrap();
        assert!(config.mcp.is_none());
    }

    #[test]
    fn test_load_invalid_json5_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ agents: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, LinkscoutError::Config { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_add_and_remove_mcp_server() {
        let mut config = Config::default();
        let server = McpServerConfig {
            name: "local".into(),
            command: "node".into(),
            args: vec!["server.js".into()],
            env: BTreeMap::new(),
            cwd: None,
            request_timeout_ms: 1000,
        };
        assert!(!config.add_mcp_server(server.clone()));
        assert!(config.add_mcp_server(McpServerConfig {
            request_timeout_ms: 2000,
            ..server
        }));
        assert_eq!(config.mcp_servers().len(), 1);
        assert_eq!(config.mcp_servers()[0].request_timeout_ms, 2000);

        config.mcp.as_mut().unwrap().default_server = Some("local".into());
        let removed = config.remove_mcp_server("local").unwrap();
        assert_eq!(removed.name, "local");
        assert!(config.mcp.as_ref().unwrap().default_server.is_none());
        assert!(config.remove_mcp_server("local").is_none());
        // Falls back to the built-in server once nothing is registered.
        assert_eq!(config.mcp_servers()[0].name, "playwright");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.add_mcp_server(McpServerConfig::playwright());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.mcp_servers(), vec![McpServerConfig::playwright()]);
    }

    #[test]
    fn test_edit_and_save_keeps_env_references() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_LS_SAVED_SECRET", "sk-ant-secret-value") };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ models: { providers: [{ id: "anthropic", api_key: "${TEST_LS_SAVED_SECRET}" }] } }"#,
        )
        .unwrap();

        assert_eq!(
            Config::load(&path).unwrap().anthropic_api_key().as_deref(),
            Some("sk-ant-secret-value")
        );

        let mut config = Config::load_unresolved(&path).unwrap();
        config.add_mcp_server(McpServerConfig::playwright());
        config.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("${TEST_LS_SAVED_SECRET}"));
        assert!(!written.contains("sk-ant-secret-value"));

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.anthropic_api_key().as_deref(), Some("sk-ant-secret-value"));
        assert_eq!(reloaded.mcp_servers(), vec![McpServerConfig::playwright()]);
        unsafe { std::env::remove_var("TEST_LS_SAVED_SECRET") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_reports_bad_servers() {
        let mut config = Config::default();
        let bad = McpServerConfig {
            name: "dup".into(),
            command: " ".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            request_timeout_ms: 0,
        };
        config.mcp = Some(McpConfig {
            default_server: Some("ghost".into()),
            servers: vec![bad.clone(), bad],
        });
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("empty command")));
        assert!(errors.iter().any(|e| e.contains("zero request timeout")));
        assert!(errors.iter().any(|e| e.contains("Duplicate")));
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            models: Some(ModelsConfig {
                providers: Some(vec![ProviderConfig {
                    id: "anthropic".into(),
                    api_key: None,
                    api_key_env: None,
                    base_url: None,
                    default_model: None,
                }]),
            }),
            ..Config::default()
        };
        let (warnings, _errors) = config.validate();
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("anthropic") && w.to_lowercase().contains("key")),
            "Expected a warning about missing API key for anthropic, got: {warnings:?}"
        );
    }
}
