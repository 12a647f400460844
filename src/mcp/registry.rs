use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// One discovered tool, registered at initialization.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    /// Canonical name exposed to callers, possibly disambiguated.
    pub name: String,
    pub description: String,
    pub schema: Value,
    /// Server that owns this tool.
    pub server_name: String,
    /// Name the server knows the tool by, used for the actual call.
    pub original_name: String,
}

/// External tool-schema shape consumed by the LLM-facing caller.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// In-memory index of every tool across all connected MCP servers.
///
/// Canonical names are unique: the first server to register a name keeps it,
/// later registrations of the same name by a different server are stored
/// under `{server}_{tool}`. Mutated only by the manager during
/// initialization and teardown; tool calls only read it.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolInfo>,
    server_tools: HashMap<String, Vec<String>>,
    // Global registration order for stable listings.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool and returns the canonical name it was stored under.
    /// Re-registration by the same server overwrites in place.
    pub fn register_tool(
        &mut self,
        server_name: &str,
        tool_name: &str,
        description: &str,
        schema: Value,
    ) -> String {
        let mut final_name = tool_name.to_string();
        if let Some(existing) = self.tools.get(&final_name) {
            if existing.server_name != server_name {
                final_name = format!("{}_{}", server_name, tool_name);
                warn!(
                    tool = tool_name,
                    owner = %existing.server_name,
                    renamed = %final_name,
                    "Tool name conflict, renaming"
                );
            }
        }

        let info = ToolInfo {
            name: final_name.clone(),
            description: description.to_string(),
            schema,
            server_name: server_name.to_string(),
            original_name: tool_name.to_string(),
        };

        match self.tools.insert(final_name.clone(), info) {
            None => {
                self.order.push(final_name.clone());
                self.server_tools
                    .entry(server_name.to_string())
                    .or_default()
                    .push(final_name.clone());
            }
            Some(previous) if previous.server_name != server_name => {
                // A prefixed name collided with an entry another server
                // already held; ownership moves to the new server.
                if let Some(names) = self.server_tools.get_mut(&previous.server_name) {
                    names.retain(|name| name != &final_name);
                }
                self.server_tools
                    .entry(server_name.to_string())
                    .or_default()
                    .push(final_name.clone());
            }
            Some(_) => {}
        }

        final_name
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.get(name)
    }

    /// Tools owned by one server, in registration order.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<&ToolInfo> {
        self.server_tools
            .get(server_name)
            .map(|names| names.iter().filter_map(|name| self.tools.get(name)).collect())
            .unwrap_or_default()
    }

    pub fn all_tools(&self) -> Vec<&ToolInfo> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .collect()
    }

    /// Schemas for every registered tool, in the shape the LLM caller takes.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.all_tools()
            .into_iter()
            .map(|tool| ToolSchema {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.schema.clone(),
            })
            .collect()
    }

    /// Removes every tool owned by the server; used on teardown and reload.
    pub fn clear_server_tools(&mut self, server_name: &str) {
        if let Some(names) = self.server_tools.remove(server_name) {
            for name in &names {
                self.tools.remove(name);
            }
            self.order.retain(|name| !names.contains(name));
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
