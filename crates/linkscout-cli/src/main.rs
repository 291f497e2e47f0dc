use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use linkscout_agent::prompt::social_links_prompt;
use linkscout_agent::{SocialLinksTask, extract_social_links};
use linkscout_core::config::{Config, McpConfig, McpServerConfig};
use linkscout_mcp::McpClient;
use linkscout_providers::Credentials;
use linkscout_providers::anthropic::AnthropicProvider;

mod logging;

#[derive(Parser)]
#[command(
    name = "linkscout",
    about = "Extract a web page's social media links with an LLM driving a browser MCP server",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.linkscout/config.json)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract social media links from a page and print them keyed by platform
    Extract {
        /// Page to inspect
        url: String,

        /// Class name expected on the element holding the links
        #[arg(long)]
        container: Option<String>,

        /// MCP server to drive (default: the configured default server)
        #[arg(long)]
        server: Option<String>,

        /// Model to use
        #[arg(long)]
        model: Option<String>,

        /// Maximum agent iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Also write the JSON result to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the task prompt sent to the model
    Prompt {
        /// Page to inspect
        url: String,

        /// Class name expected on the element holding the links
        #[arg(long)]
        container: Option<String>,
    },

    /// MCP server management
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum McpAction {
    /// Start a server, complete the handshake and list its tools
    Check {
        /// Server name (default: the configured default server)
        name: Option<String>,
    },
    /// List registered servers
    List,
    /// Register a server
    Add {
        name: String,

        /// Executable to launch
        #[arg(long)]
        command: String,

        /// Environment variable for the server (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Working directory for the server
        #[arg(long)]
        cwd: Option<String>,

        /// Per-request timeout in milliseconds
        #[arg(long, default_value_t = 120_000)]
        timeout_ms: u64,

        /// Make this the default server
        #[arg(long)]
        default: bool,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Remove a registered server
    Remove { name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    logging::init(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Extract {
            url,
            container,
            server,
            model,
            max_iterations,
            output,
        } => {
            let task = SocialLinksTask {
                url,
                container_hint: container,
                model,
                max_iterations,
            };
            run_extract(config, &task, server.as_deref(), output.as_deref()).await?;
        }
        Commands::Prompt { url, container } => {
            print!("{}", social_links_prompt(&url, container.as_deref()));
        }
        Commands::Mcp { action } => match action {
            McpAction::Check { name } => check_server(&config, name.as_deref()).await?,
            McpAction::List => {
                let default = config
                    .mcp_server(None)
                    .map(|s| s.name)
                    .unwrap_or_default();
                let registered = config.mcp.as_ref().is_some_and(|m| !m.servers.is_empty());
                for server in config.mcp_servers() {
                    let mut marks = Vec::new();
                    if server.name == default {
                        marks.push("default");
                    }
                    if !registered {
                        marks.push("built-in");
                    }
                    let marks = if marks.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", marks.join(", "))
                    };
                    println!("{}{marks}: {}", server.name, server.command_line());
                }
            }
            McpAction::Add {
                name,
                command,
                env,
                cwd,
                timeout_ms,
                default,
                args,
            } => {
                let mut config = load_for_edit(&config_path)?;
                let server = McpServerConfig {
                    name: name.clone(),
                    command,
                    args,
                    env: env.into_iter().collect(),
                    cwd,
                    request_timeout_ms: timeout_ms,
                };
                let replaced = config.add_mcp_server(server);
                if default {
                    config.mcp.get_or_insert_with(McpConfig::default).default_server =
                        Some(name.clone());
                }
                save_config(&config, &config_path)?;
                if replaced {
                    println!("Updated MCP server '{name}'");
                } else {
                    println!("Added MCP server '{name}'");
                }
            }
            McpAction::Remove { name } => {
                let mut config = load_for_edit(&config_path)?;
                if config.remove_mcp_server(&name).is_none() {
                    anyhow::bail!("MCP server '{name}' is not registered");
                }
                save_config(&config, &config_path)?;
                println!("Removed MCP server '{name}'");
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!(
                        "{} error(s) in {}",
                        errors.len(),
                        config_path.display()
                    );
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("linkscout v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Model: {}", config.default_model());
            let servers: Vec<String> = config.mcp_servers().into_iter().map(|s| s.name).collect();
            println!("MCP servers: {}", servers.join(", "));
            let key = if config.anthropic_api_key().is_some() {
                "configured"
            } else {
                "missing"
            };
            println!("Anthropic API key: {key}");
        }
    }

    Ok(())
}

/// Config as written on disk, with `${ENV}` references intact, for commands that save it back.
fn load_for_edit(path: &Path) -> anyhow::Result<Config> {
    Config::load_unresolved(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn save_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    config
        .save(path)
        .with_context(|| format!("failed to save config to {}", path.display()))
}

fn find_server(config: &Config, name: Option<&str>) -> anyhow::Result<McpServerConfig> {
    config.mcp_server(name).with_context(|| match name {
        Some(name) => format!("MCP server '{name}' is not registered; see `linkscout mcp list`"),
        None => format!(
            "Default MCP server '{}' is not registered; see `linkscout mcp list`",
            config
                .mcp
                .as_ref()
                .and_then(|m| m.default_server.as_deref())
                .unwrap_or_default()
        ),
    })
}

async fn spawn_server(server: &McpServerConfig) -> anyhow::Result<McpClient> {
    McpClient::spawn(server).await.with_context(|| {
        format!(
            "failed to start MCP server '{}' ({}); run `linkscout mcp check {}` to diagnose",
            server.name,
            server.command_line(),
            server.name
        )
    })
}

async fn run_extract(
    config: Config,
    task: &SocialLinksTask,
    server: Option<&str>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let api_key = config.anthropic_api_key().context(
        "No Anthropic API key configured. Set ANTHROPIC_API_KEY or add an api_key for the \"anthropic\" provider in the config file",
    )?;
    let server = find_server(&config, server)?;
    let base_url = config
        .provider("anthropic")
        .and_then(|p| p.base_url.clone());
    let provider = AnthropicProvider::new(base_url.as_deref());
    let credentials = Credentials::ApiKey { api_key };

    info!(url = %task.url, server = %server.name, "Starting extraction");
    let client = Arc::new(spawn_server(&server).await?);

    let result = extract_social_links(task, &config, &provider, &credentials, &client).await;
    client.shutdown().await;
    let report = result?;

    if let Some(selector) = &report.container_selector {
        info!(%selector, "Social links container");
    }
    info!(links = report.links.len(), platforms = report.platforms.len(), "Extraction complete");

    let json = serde_json::to_string_pretty(&report.platforms)?;
    println!("{json}");

    if let Some(path) = output {
        std::fs::write(path, format!("{json}\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Results saved");
    }

    Ok(())
}

async fn check_server(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let server = find_server(config, name)?;
    println!("Server: {} ({})", server.name, server.command_line());

    let client = spawn_server(&server).await?;
    if let Some(info) = client.server_info() {
        println!(
            "Connected: {} {} (protocol {})",
            info.server_info.name, info.server_info.version, info.protocol_version
        );
    }

    let tools = client.list_tools().await;
    client.shutdown().await;
    let tools = tools.with_context(|| format!("failed to list tools from '{}'", server.name))?;

    if tools.is_empty() {
        anyhow::bail!("MCP server '{}' exposes no tools", server.name);
    }
    println!("Tools ({}):", tools.len());
    for tool in &tools {
        match &tool.description {
            Some(description) => {
                let summary = description.lines().next().unwrap_or_default();
                println!("  {} - {summary}", tool.name);
            }
            None => println!("  {}", tool.name),
        }
    }
    Ok(())
}
