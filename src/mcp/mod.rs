mod error;
mod handler;
mod http;
mod manager;
mod registry;
mod stdio;
mod types;

pub use error::{McpError, Result};
pub use handler::McpHandler;
pub use http::HttpHandler;
pub use manager::McpManager;
pub use registry::{ToolInfo, ToolRegistry, ToolSchema};
pub use stdio::{StdioHandler, StdioKind};
pub use types::Tool;
