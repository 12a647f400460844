mod config;
mod mcp;
mod utils;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::mcp::McpManager;

#[derive(Parser)]
#[command(name = "tool-relay", about = "Multiplexes tool calls across MCP servers")]
struct Cli {
    /// Path to the MCP server configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every tool advertised by the configured servers
    Tools,
    /// Call one tool and print the normalized result
    Call {
        /// Canonical tool name as shown by `tools`
        name: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let mut manager = McpManager::new();
    manager.initialize(&config.mcp_servers).await;

    let result = run(&manager, cli.command).await;
    manager.cleanup().await;
    result
}

async fn run(manager: &McpManager, command: Commands) -> Result<()> {
    match command {
        Commands::Tools => {
            let schemas = manager.tool_schemas();
            println!("{}", serde_json::to_string_pretty(&schemas)?);
        }
        Commands::Call { name, args } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)?;
            let result = manager.call_tool(&name, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
