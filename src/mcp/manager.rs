use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ServerConfig, TransportKind};

use super::error::{McpError, Result};
use super::handler::McpHandler;
use super::http::HttpHandler;
use super::registry::{ToolInfo, ToolRegistry, ToolSchema};
use super::stdio::{StdioHandler, StdioKind};

/// Inline image payloads whose base64 encoding reaches this many bytes are
/// written to disk and replaced by a path reference.
const LARGE_OUTPUT_THRESHOLD: usize = 10_000;
const CONTENT_SEPARATOR: &str = "\n\n---\n\n";
const DEFAULT_OUTPUT_DIR: &str = "screenshots";

/// Owns the configured MCP servers, routes tool calls through the registry
/// to the right handler, and normalizes results for the LLM-facing caller.
pub struct McpManager {
    handlers: HashMap<String, Arc<dyn McpHandler>>,
    registry: ToolRegistry,
    output_dir: PathBuf,
}

impl McpManager {
    pub fn new() -> Self {
        Self::with_output_dir(PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    /// `output_dir` receives oversized inline images extracted from tool
    /// results.
    pub fn with_output_dir(output_dir: PathBuf) -> Self {
        Self {
            handlers: HashMap::new(),
            registry: ToolRegistry::new(),
            output_dir,
        }
    }

    fn create_handler(config: &ServerConfig) -> Result<Arc<dyn McpHandler>> {
        match config.transport {
            TransportKind::Process => Ok(Arc::new(StdioHandler::new(
                StdioKind::Process,
                config.clone(),
            )?)),
            TransportKind::Container => Ok(Arc::new(StdioHandler::new(
                StdioKind::Container,
                config.clone(),
            )?)),
            TransportKind::Http => Ok(Arc::new(HttpHandler::new(config.clone())?)),
            TransportKind::Unknown => Err(McpError::Config(format!(
                "Unknown server type for '{}'",
                config.name
            ))),
        }
    }

    /// Connects every enabled server concurrently and registers the tools it
    /// advertises. One server's failure never blocks another's registration;
    /// failures are logged and the server is simply left without tools.
    pub async fn initialize(&mut self, configs: &[ServerConfig]) {
        let mut tasks = Vec::new();
        for config in configs {
            if !config.enabled {
                continue;
            }
            let handler = match Self::create_handler(config) {
                Ok(handler) => handler,
                Err(err) => {
                    error!(server = %config.name, error = %err, "Skipping misconfigured server");
                    continue;
                }
            };
            self.handlers.insert(config.name.clone(), handler.clone());
            tasks.push(async move {
                info!(server = %handler.name(), "Initializing MCP server");
                let outcome = async {
                    handler.connect().await?;
                    handler.list_tools().await
                }
                .await;
                (handler, outcome)
            });
        }

        for (handler, outcome) in join_all(tasks).await {
            match outcome {
                Ok(tools) => {
                    info!(
                        server = %handler.name(),
                        count = tools.len(),
                        "Initialized MCP server"
                    );
                    for tool in tools {
                        self.registry.register_tool(
                            handler.name(),
                            &tool.name,
                            tool.description.as_deref().unwrap_or(""),
                            tool.input_schema,
                        );
                    }
                }
                Err(err) => {
                    error!(server = %handler.name(), error = %err, "Failed to initialize MCP server");
                }
            }
        }
    }

    /// Routes one tool call by canonical name and normalizes the result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .registry
            .get_tool(name)
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
        let handler = self.handlers.get(&tool.server_name).ok_or_else(|| {
            McpError::ServerNotFound {
                server: tool.server_name.clone(),
                tool: name.to_string(),
            }
        })?;

        debug!(server = %tool.server_name, tool = %tool.original_name, "Routing tool call");
        let result = handler
            .call_tool(&tool.original_name, arguments)
            .await
            .map_err(|err| {
                error!(
                    server = %tool.server_name,
                    tool = %tool.original_name,
                    error = %err,
                    "Tool call failed"
                );
                err
            })?;

        Ok(self.process_tool_result(result))
    }

    /// Disconnects all servers concurrently; a server that cannot disconnect
    /// cleanly does not block the others.
    pub async fn cleanup(&self) {
        let tasks = self.handlers.values().cloned().map(|handler| async move {
            if let Err(err) = handler.disconnect().await {
                warn!(server = %handler.name(), error = %err, "Failed to disconnect cleanly");
            }
        });
        join_all(tasks).await;
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolInfo> {
        self.registry.get_tool(name)
    }

    pub fn all_tools(&self) -> Vec<&ToolInfo> {
        self.registry.all_tools()
    }

    pub fn tools_for_server(&self, server_name: &str) -> Vec<&ToolInfo> {
        self.registry.tools_for_server(server_name)
    }

    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry.tool_schemas()
    }

    /// Normalizes a raw content array into an agent-friendly response.
    ///
    /// Resource wrappers are unwrapped first: if any item carried one, the
    /// whole result collapses to the extracted content. Otherwise oversized
    /// inline images are moved to disk and replaced by path references.
    /// Everything else passes through unchanged.
    fn process_tool_result(&self, result: Value) -> Value {
        let Value::Array(items) = result else {
            return result;
        };

        let mut processed = Vec::with_capacity(items.len());
        let mut extracted = Vec::new();

        for item in items {
            if let Some(content) = extract_resource(&item) {
                extracted.push(content);
                continue;
            }
            processed.push(self.shrink_image(item));
        }

        if !extracted.is_empty() {
            if extracted.len() == 1 {
                return Value::String(extracted.remove(0));
            }
            return Value::String(extracted.join(CONTENT_SEPARATOR));
        }

        Value::Array(processed)
    }

    fn shrink_image(&self, item: Value) -> Value {
        let oversized = item.get("type").and_then(Value::as_str) == Some("image")
            && item
                .get("data")
                .and_then(Value::as_str)
                .map_or(false, |data| data.len() >= LARGE_OUTPUT_THRESHOLD);
        if !oversized {
            return item;
        }
        let Value::Object(mut map) = item else {
            return item;
        };
        let Some(data) = map.get("data").and_then(Value::as_str).map(str::to_string) else {
            return Value::Object(map);
        };

        match self.save_image(&data) {
            Ok(path) => {
                let path = path.display().to_string();
                map.insert(
                    "data".to_string(),
                    Value::String(format!("[Image saved to {}]", path)),
                );
                map.insert("saved_to".to_string(), Value::String(path));
            }
            Err(err) => {
                error!(error = %err, "Failed to save oversized image");
                map.insert(
                    "data".to_string(),
                    Value::String("[Image data too large and failed to save]".to_string()),
                );
            }
        }
        Value::Object(map)
    }

    fn save_image(&self, data: &str) -> Result<PathBuf> {
        let bytes = STANDARD.decode(data)?;
        std::fs::create_dir_all(&self.output_dir)?;
        let filename = format!("screenshot_{}.png", Uuid::new_v4());
        let path = self.output_dir.join(filename);
        std::fs::write(&path, bytes)?;
        Ok(std::fs::canonicalize(&path).unwrap_or(path))
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls the inline payload out of a resource-wrapped content item.
fn extract_resource(item: &Value) -> Option<String> {
    if item.get("type").and_then(Value::as_str) != Some("resource") {
        return None;
    }
    let resource = item.get("resource")?;
    resource
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| resource.get("data").and_then(Value::as_str))
        .map(str::to_string)
}
