use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error for server '{server}': {message}")]
    Connection { server: String, message: String },

    #[error("Server '{0}' is unavailable")]
    ServerUnavailable(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Server '{server}' not found for tool '{tool}'")]
    ServerNotFound { server: String, tool: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl McpError {
    pub(crate) fn connection(server: impl Into<String>, message: impl std::fmt::Display) -> Self {
        McpError::Connection {
            server: server.into(),
            message: message.to_string(),
        }
    }

    /// Whether this is a transport-level failure, classified where the error
    /// originates. Drives the single reconnect-and-retry at the handler
    /// boundary; application-level failures never trigger a reconnect.
    pub fn is_connection(&self) -> bool {
        match self {
            McpError::Connection { .. } => true,
            McpError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            McpError::Http(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
