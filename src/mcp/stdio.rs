use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::utils::exact_placeholder;

use super::error::{McpError, Result};
use super::handler::McpHandler;
use super::types::{
    concat_text_fragments, InitializeParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, Tool, ToolCallParams, ToolCallResult,
};

/// Line-delimited JSON-RPC client over an arbitrary byte stream pair.
///
/// Generic over the reader/writer so the framing can be exercised against
/// in-memory streams; in production the peer is a child process's stdio.
#[derive(Debug)]
pub(crate) struct RpcClient<R, W> {
    reader: BufReader<R>,
    writer: W,
    server: String,
    next_id: u64,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(server: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            server: server.into(),
            next_id: 0,
        }
    }

    /// MCP handshake: `initialize` request followed by the `initialized`
    /// notification. The server does not count as connected before this
    /// completes.
    pub async fn initialize(&mut self) -> Result<Value> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.request("initialize", params).await?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        let result = self.request("tools/list", serde_json::json!({})).await?;
        let parsed: ListToolsResult = serde_json::from_value(result).map_err(|err| {
            McpError::Protocol(format!(
                "Invalid tools/list result from '{}': {}",
                self.server, err
            ))
        })?;
        Ok(parsed.tools)
    }

    /// Invokes one tool. An `isError` result is surfaced as
    /// `McpError::ToolExecution` carrying the concatenated text fragments.
    pub async fn call_tool(&mut self, name: &str, arguments: &Value) -> Result<Value> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: arguments.clone(),
        };
        let result = self
            .request("tools/call", serde_json::to_value(params)?)
            .await?;
        let call: ToolCallResult = serde_json::from_value(result).map_err(|err| {
            McpError::Protocol(format!(
                "Invalid tools/call result from '{}': {}",
                self.server, err
            ))
        })?;
        if call.is_error == Some(true) {
            return Err(McpError::ToolExecution(concat_text_fragments(
                &call.content,
            )));
        }
        Ok(Value::Array(call.content))
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let request = JsonRpcRequest::new(id, method, params);
        self.send_line(&serde_json::to_string(&request)?).await?;

        loop {
            let line = self.read_line().await?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(line).map_err(|err| {
                McpError::Protocol(format!(
                    "Invalid JSON-RPC message from '{}': {}",
                    self.server, err
                ))
            })?;
            // Servers may interleave notifications or log lines with
            // responses; only the reply to our request id terminates the loop.
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                debug!(server = %self.server, "Skipping message without matching request id");
                continue;
            }
            let response: JsonRpcResponse = serde_json::from_value(message).map_err(|err| {
                McpError::Protocol(format!(
                    "Invalid JSON-RPC response from '{}': {}",
                    self.server, err
                ))
            })?;
            if let Some(error) = response.error {
                return Err(McpError::Protocol(format!(
                    "JSON-RPC error from '{}': {}",
                    self.server, error
                )));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.send_line(&serde_json::to_string(&notification)?).await
    }

    async fn send_line(&mut self, payload: &str) -> Result<()> {
        self.writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| McpError::connection(&self.server, err))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|err| McpError::connection(&self.server, err))?;
        self.writer
            .flush()
            .await
            .map_err(|err| McpError::connection(&self.server, err))?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|err| McpError::connection(&self.server, err))?;
        if read == 0 {
            return Err(McpError::connection(&self.server, "connection closed"));
        }
        Ok(line)
    }
}

/// How the subprocess for a stdio server is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioKind {
    /// Run the configured command directly.
    Process,
    /// Wrap the server in a `docker run -i --rm` invocation; configured env
    /// entries become `-e KEY=VALUE` arguments.
    Container,
}

#[derive(Debug)]
struct StdioSession {
    child: Child,
    rpc: RpcClient<ChildStdout, ChildStdin>,
}

/// Handler for MCP servers spoken to over child-process stdio.
#[derive(Debug)]
pub struct StdioHandler {
    name: String,
    kind: StdioKind,
    config: ServerConfig,
    // Also serializes tool calls: at most one in-flight request per child.
    session: Mutex<Option<StdioSession>>,
}

impl StdioHandler {
    pub fn new(kind: StdioKind, config: ServerConfig) -> Result<Self> {
        if kind == StdioKind::Process && config.command.is_none() {
            return Err(McpError::Config(format!(
                "Server '{}' requires a command",
                config.name
            )));
        }
        Ok(Self {
            name: config.name.clone(),
            kind,
            config,
            session: Mutex::new(None),
        })
    }

    fn build_command(&self) -> Result<Command> {
        match self.kind {
            StdioKind::Process => {
                let program = self.config.command.as_deref().ok_or_else(|| {
                    McpError::Config(format!("Server '{}' requires a command", self.name))
                })?;
                let mut cmd = Command::new(program);
                cmd.args(&self.config.args);
                if let Some(cwd) = &self.config.cwd {
                    cmd.current_dir(cwd);
                }
                for (key, value) in &self.config.env {
                    match exact_placeholder(value) {
                        Some(var) => match std::env::var(var) {
                            Ok(resolved) => {
                                cmd.env(key, resolved);
                            }
                            Err(_) => {
                                warn!(
                                    server = %self.name,
                                    variable = var,
                                    "Environment variable not found, dropping entry"
                                );
                            }
                        },
                        None => {
                            cmd.env(key, value);
                        }
                    }
                }
                Ok(cmd)
            }
            StdioKind::Container => {
                let mut cmd = Command::new("docker");
                cmd.args(["run", "-i", "--rm"]);
                for (key, value) in &self.config.env {
                    let resolved = match exact_placeholder(value) {
                        Some(var) => std::env::var(var).ok(),
                        None => Some(value.clone()),
                    };
                    if let Some(resolved) = resolved {
                        cmd.arg("-e").arg(format!("{}={}", key, resolved));
                    }
                }
                // Image name and any server arguments come last.
                cmd.args(&self.config.args);
                Ok(cmd)
            }
        }
    }

    async fn open_session(&self) -> Result<StdioSession> {
        let mut cmd = self.build_command()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            error!(server = %self.name, error = %err, "Failed to spawn MCP server process");
            McpError::connection(&self.name, format!("failed to spawn process: {}", err))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection(&self.name, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection(&self.name, "child stdout unavailable"))?;

        let mut rpc = RpcClient::new(&self.name, stdout, stdin);
        if let Err(err) = rpc.initialize().await {
            error!(server = %self.name, error = %err, "Handshake with MCP server failed");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        info!(server = %self.name, "Connected to stdio MCP server");
        Ok(StdioSession { child, rpc })
    }

    async fn close_session(&self, slot: &mut Option<StdioSession>) {
        if let Some(mut session) = slot.take() {
            if let Err(err) = session.child.start_kill() {
                debug!(server = %self.name, error = %err, "Child process already gone");
            }
            let _ = session.child.wait().await;
        }
    }

    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<StdioSession>,
    ) -> Result<&'a mut StdioSession> {
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
impl McpHandler for StdioHandler {
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
        let mut slot = self.session.lock().await;
        self.close_session(&mut *slot).await;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut slot = self.session.lock().await;
        let session = self.ensure_session(&mut *slot).await?;
        match session.rpc.list_tools().await {
            Ok(tools) => Ok(tools),
            Err(err) => {
                warn!(server = %self.name, error = %err, "Listing tools failed, reconnecting");
                self.close_session(&mut *slot).await;
                let retried = match self.ensure_session(&mut *slot).await {
                    Ok(session) => session.rpc.list_tools().await,
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
        let mut slot = self.session.lock().await;
        let session = self.ensure_session(&mut *slot).await?;
        match session.rpc.call_tool(name, &arguments).await {
            Err(err) if err.is_connection() => {
                warn!(
                    server = %self.name,
                    tool = name,
                    error = %err,
                    "Connection lost during tool call, retrying once"
                );
                self.close_session(&mut *slot).await;
                let session = self.ensure_session(&mut *slot).await?;
                session.rpc.call_tool(name, &arguments).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Runs a scripted JSON-RPC peer on the far end of a duplex pipe:
    /// for every request line received, sends the next canned result
    /// (echoing the request id). Notifications are consumed silently.
    fn scripted_peer(stream: DuplexStream, results: Vec<Value>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            let mut results = results.into_iter();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = serde_json::from_str(&line).unwrap();
                let Some(id) = message.get("id").cloned() else {
                    continue;
                };
                let Some(result) = results.next() else {
                    break;
                };
                let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                let payload = format!("{}\n", response);
                write.write_all(payload.as_bytes()).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn initialize_performs_handshake_and_skips_notification() {
        let (ours, theirs) = duplex(4096);
        let peer = scripted_peer(
            theirs,
            vec![json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "mock", "version": "0.0.1"}
            })],
        );

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let result = rpc.initialize().await.unwrap();
        assert_eq!(result["serverInfo"]["name"], "mock");
        drop(rpc);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn list_tools_parses_advertised_tools() {
        let (ours, theirs) = duplex(4096);
        let _peer = scripted_peer(
            theirs,
            vec![json!({
                "tools": [
                    {"name": "ping", "description": "Replies with pong",
                     "inputSchema": {"type": "object", "properties": {}}},
                    {"name": "bare"}
                ]
            })],
        );

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let tools = rpc.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "ping");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn call_tool_returns_raw_content_array() {
        let (ours, theirs) = duplex(4096);
        let _peer = scripted_peer(
            theirs,
            vec![json!({
                "content": [{"type": "text", "text": "pong"}]
            })],
        );

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let result = rpc.call_tool("ping", &json!({})).await.unwrap();
        assert_eq!(result, json!([{"type": "text", "text": "pong"}]));
    }

    #[tokio::test]
    async fn is_error_result_becomes_tool_execution_error() {
        let (ours, theirs) = duplex(4096);
        let _peer = scripted_peer(
            theirs,
            vec![json!({
                "content": [{"type": "text", "text": "disk full"}],
                "isError": true
            })],
        );

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let err = rpc.call_tool("write", &json!({})).await.unwrap_err();
        assert!(!err.is_connection());
        match err {
            McpError::ToolExecution(message) => assert_eq!(message, "disk full"),
            other => panic!("expected ToolExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_peer_yields_connection_error() {
        let (ours, theirs) = duplex(4096);
        drop(theirs);

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let err = rpc.call_tool("ping", &json!({})).await.unwrap_err();
        assert!(err.is_connection(), "unexpected error class: {:?}", err);
    }

    #[tokio::test]
    async fn json_rpc_error_is_a_protocol_error_not_a_connection_error() {
        let (ours, theirs) = duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let message: Value = serde_json::from_str(&line).unwrap();
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": message["id"],
                    "error": {"code": -32601, "message": "Method not found"}
                });
                let payload = format!("{}\n", response);
                write.write_all(payload.as_bytes()).await.unwrap();
            }
        });

        let (read, write) = tokio::io::split(ours);
        let mut rpc = RpcClient::new("mock", read, write);
        let err = rpc.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)));
        assert!(!err.is_connection());
    }

    #[test]
    fn process_handler_requires_a_command() {
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "broken", "type": "process", "enabled": true
        }))
        .unwrap();
        let err = StdioHandler::new(StdioKind::Process, config).unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[test]
    fn container_command_wraps_docker_run() {
        std::env::set_var("TOOL_RELAY_TEST_STDIO_KEY", "secret");
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "boxed", "type": "container", "enabled": true,
            "args": ["ghcr.io/acme/server:latest"],
            "env": {
                "API_KEY": "${TOOL_RELAY_TEST_STDIO_KEY}",
                "MISSING": "${TOOL_RELAY_TEST_STDIO_ABSENT}"
            }
        }))
        .unwrap();
        let handler = StdioHandler::new(StdioKind::Container, config).unwrap();
        let cmd = handler.build_command().unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "docker");

        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..3], ["run", "-i", "--rm"]);
        assert!(args.contains(&"API_KEY=secret".to_string()));
        // Unresolved placeholders are dropped, not passed through literally.
        assert!(!args.iter().any(|a| a.contains("MISSING")));
        assert_eq!(args.last().unwrap(), "ghcr.io/acme/server:latest");
    }
}
