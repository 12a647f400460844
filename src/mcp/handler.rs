use super::error::Result;
use super::types::Tool;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// One live (or not-yet-connected) connection to an MCP server.
///
/// Implementations serialize tool calls internally, so at most one request
/// is in flight per physical connection; concurrent callers queue.
/// `list_tools` and `call_tool` perform exactly one reconnect-and-retry on
/// a connection-classified failure and never retry beyond that.
#[async_trait]
pub trait McpHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the transport-level session. On failure, partially created
    /// resources are torn down before the error propagates.
    async fn connect(&self) -> Result<()>;

    /// Release all transport resources. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// The sole recovery path for a lost session.
    async fn reconnect(&self) -> Result<()> {
        info!(server = %self.name(), "Reconnecting to MCP server");
        self.disconnect().await?;
        self.connect().await
    }

    /// The server's currently advertised tool set. Connects implicitly when
    /// disconnected; a failure surviving one reconnect-and-retry propagates
    /// as `McpError::ServerUnavailable`.
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Invoke one tool by its server-side name. Returns the provider-native
    /// content array unprocessed; normalization is the manager's job.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}
