use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::utils::substitute;

use super::error::{McpError, Result};
use super::handler::McpHandler;
use super::types::{
    concat_text_fragments, empty_object_schema, InitializeParams, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, Tool, ToolCallParams, ToolCallResult,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "Mcp-Session-Id";

#[derive(Debug)]
struct HttpSession {
    client: Client,
    session_id: Option<String>,
    next_id: u64,
}

/// Handler for remote MCP servers speaking JSON-RPC 2.0 over plain HTTP.
///
/// Session affinity is carried via the `Mcp-Session-Id` header once obtained
/// from the handshake response. Supports per-server header templates and
/// tool default injection, both with `${NAME}` placeholder resolution.
#[derive(Debug)]
pub struct HttpHandler {
    name: String,
    url: String,
    config: ServerConfig,
    // Also serializes tool calls against this server.
    session: Mutex<Option<HttpSession>>,
}

impl HttpHandler {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| {
            McpError::Config(format!("Server '{}' requires a url", config.name))
        })?;
        Ok(Self {
            name: config.name.clone(),
            url,
            config,
            session: Mutex::new(None),
        })
    }

    /// Fixed defaults overlaid with configured headers, placeholders resolved
    /// first against the server's own env map, then the host environment.
    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tool-relay/", env!("CARGO_PKG_VERSION"))),
        );

        for (key, value) in &self.config.headers {
            let resolved = substitute(value, &self.config.env);
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
                McpError::Config(format!("Invalid header name '{}': {}", key, err))
            })?;
            let value = HeaderValue::from_str(&resolved).map_err(|err| {
                McpError::Config(format!("Invalid value for header '{}': {}", key, err))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn resolved_defaults(&self) -> HashMap<String, String> {
        self.config
            .tool_defaults
            .iter()
            .map(|(key, value)| (key.clone(), substitute(value, &self.config.env)))
            .collect()
    }

    async fn open_session(&self) -> Result<HttpSession> {
        let headers = self.build_headers()?;
        debug!(
            server = %self.name,
            url = %self.url,
            headers = %redacted(&headers),
            "Connecting to HTTP MCP server"
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let params = serde_json::to_value(InitializeParams::default())?;
        let request = JsonRpcRequest::new(1, "initialize", params);
        let response = client.post(&self.url).json(&request).send().await?;

        let status = response.status();
        let header_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Protocol(format!(
                "Initialize failed for '{}' with HTTP {}: {}",
                self.name, status, body
            )));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|err| {
            McpError::Protocol(format!(
                "Invalid initialize response from '{}': {}",
                self.name, err
            ))
        })?;
        if let Some(rpc_error) = body.error {
            return Err(McpError::Protocol(format!(
                "Initialize failed for '{}': JSON-RPC error: {}",
                self.name, rpc_error
            )));
        }

        // Header lookup above is case-insensitive; the body field is the
        // fallback for servers that only report the session there.
        let session_id = header_session.or_else(|| {
            body.result
                .as_ref()
                .and_then(|result| result.get("sessionId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        match &session_id {
            Some(id) => info!(server = %self.name, session_id = %id, "Connected to HTTP MCP server"),
            None => warn!(server = %self.name, "No session ID received from server"),
        }

        Ok(HttpSession {
            client,
            session_id,
            next_id: 1,
        })
    }

    async fn post_rpc(&self, session: &mut HttpSession, method: &str, params: Value) -> Result<Value> {
        session.next_id += 1;
        let request = JsonRpcRequest::new(session.next_id, method, params);

        let mut builder = session.client.post(&self.url).json(&request);
        if let Some(id) = &session.session_id {
            builder = builder.header(SESSION_HEADER, id);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Protocol(format!(
                "HTTP {} from '{}': {}",
                status, self.name, body
            )));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|err| {
            McpError::Protocol(format!(
                "Invalid JSON-RPC response from '{}': {}",
                self.name, err
            ))
        })?;
        if body.id.as_ref().and_then(Value::as_u64) != Some(request.id) {
            debug!(server = %self.name, "JSON-RPC response id does not match the request");
        }
        if let Some(rpc_error) = body.error {
            return Err(McpError::Protocol(format!(
                "JSON-RPC error from '{}': {}",
                self.name, rpc_error
            )));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn fetch_tools(&self, session: &mut HttpSession) -> Result<Vec<Tool>> {
        let result = self.post_rpc(session, "tools/list", json!({})).await?;
        let parsed: ListToolsResult = serde_json::from_value(result).map_err(|err| {
            McpError::Protocol(format!(
                "Invalid tools/list result from '{}': {}",
                self.name, err
            ))
        })?;

        let mut tools = parsed.tools;
        self.inject_schema_defaults(&mut tools);
        Ok(tools)
    }

    /// Declared default parameters absent from a tool's schema are
    /// synthesized as optional string properties so the LLM-facing caller
    /// can see (and override) them.
    fn inject_schema_defaults(&self, tools: &mut [Tool]) {
        let defaults = self.resolved_defaults();
        if defaults.is_empty() {
            return;
        }

        for tool in tools {
            if !tool.input_schema.is_object() {
                tool.input_schema = empty_object_schema();
            }
            let Some(schema) = tool.input_schema.as_object_mut() else {
                continue;
            };
            let properties = schema
                .entry("properties")
                .or_insert_with(|| json!({}));
            let Some(properties) = properties.as_object_mut() else {
                continue;
            };
            for (param, value) in &defaults {
                if !properties.contains_key(param) {
                    properties.insert(
                        param.clone(),
                        json!({
                            "type": "string",
                            "description": format!("Default parameter (injected): {}", value),
                            "default": value,
                        }),
                    );
                    debug!(
                        server = %self.name,
                        tool = %tool.name,
                        param = %param,
                        "Injected default parameter into tool schema"
                    );
                }
            }
        }
    }

    /// Declared defaults the caller omitted are merged into the argument set
    /// before the call goes out.
    fn inject_argument_defaults(&self, tool: &str, arguments: &mut Value) {
        let defaults = self.resolved_defaults();
        if defaults.is_empty() {
            return;
        }
        if arguments.is_null() {
            *arguments = json!({});
        }
        let Some(map) = arguments.as_object_mut() else {
            return;
        };
        for (param, value) in defaults {
            if !map.contains_key(&param) {
                info!(server = %self.name, tool = tool, param = %param, "Auto-injected default parameter");
                map.insert(param, Value::String(value));
            }
        }
    }

    async fn invoke(&self, session: &mut HttpSession, name: &str, arguments: &Value) -> Result<Value> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: arguments.clone(),
        };
        let result = self
            .post_rpc(session, "tools/call", serde_json::to_value(params)?)
            .await?;
        let call: ToolCallResult = serde_json::from_value(result).map_err(|err| {
            McpError::Protocol(format!(
                "Invalid tools/call result from '{}': {}",
                self.name, err
            ))
        })?;
        if call.is_error == Some(true) {
            return Err(McpError::ToolExecution(concat_text_fragments(
                &call.content,
            )));
        }
        Ok(Value::Array(call.content))
    }

    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<HttpSession>,
    ) -> Result<&'a mut HttpSession> {
        if slot.is_none() {
            *slot = Some(self.open_session().await?);
        }
        match slot.as_mut() {
            Some(session) => Ok(session),
            None => Err(McpError::connection(&self.name, "session unavailable")),
        }
    }
}

#[async_trait]
impl McpHandler for HttpHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            *slot = Some(self.open_session().await?);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the client closes its connection pool.
        let mut slot = self.session.lock().await;
        *slot = None;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut slot = self.session.lock().await;
        let session = self.ensure_session(&mut *slot).await?;
        match self.fetch_tools(session).await {
            Ok(tools) => Ok(tools),
            Err(err) => {
                warn!(server = %self.name, error = %err, "Listing tools failed, reconnecting");
                *slot = None;
                let retried = match self.ensure_session(&mut *slot).await {
                    Ok(session) => self.fetch_tools(session).await,
                    Err(err) => Err(err),
                };
                retried.map_err(|err| {
                    error!(server = %self.name, error = %err, "Retry after reconnect failed");
                    McpError::ServerUnavailable(self.name.clone())
                })
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let mut arguments = arguments;
        self.inject_argument_defaults(name, &mut arguments);

        let mut slot = self.session.lock().await;
        let session = self.ensure_session(&mut *slot).await?;
        match self.invoke(session, name, &arguments).await {
            Err(err) if err.is_connection() => {
                warn!(
                    server = %self.name,
                    tool = name,
                    error = %err,
                    "Connection lost during tool call, retrying once"
                );
                *slot = None;
                let session = self.ensure_session(&mut *slot).await?;
                self.invoke(session, name, &arguments).await
            }
            other => other,
        }
    }
}

/// Header rendering for debug logs with credential values masked.
fn redacted(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            if *name == AUTHORIZATION {
                format!("{}: <redacted>", name)
            } else {
                format!("{}: {}", name, value.to_str().unwrap_or("<binary>"))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
