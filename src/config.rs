use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Transport used to reach one MCP server.
///
/// Unrecognized values deserialize to `Unknown` so a single malformed entry
/// cannot prevent the rest of the configuration from loading; the manager
/// logs and skips such servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    Container,
    Http,
    #[serde(other)]
    Unknown,
}

/// One configured MCP server. Immutable after load.
///
/// Values in `env`, `headers` and `tool_defaults` may contain `${NAME}`
/// placeholders resolved at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportKind,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_defaults: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub mcp_servers: Vec<ServerConfig>,
}

/// Get the default path to the MCP server configuration file
pub fn default_config_path() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home
        .join(".config")
        .join("tool-relay")
        .join("mcp_config.json"))
}

/// Load the server configuration from disk.
///
/// A missing file is not an error: the relay starts with no servers.
pub fn load_config(path: Option<&Path>) -> Result<McpConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, starting with no MCP servers");
        return Ok(McpConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}
