//! End-to-end tests for the stdio transport against a scripted shell
//! MCP server speaking line-delimited JSON-RPC.

use std::path::PathBuf;

use serde_json::json;

use crate::config::ServerConfig;
use crate::mcp::{McpHandler, McpManager, StdioHandler, StdioKind};

/// A minimal MCP server: answers initialize, tools/list and tools/call,
/// echoing the request id. `$RELAY_TAG` lets tests tell instances apart.
const SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"Replies with pong","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong from %s"}]}}\n' "$id" "${RELAY_TAG:-none}"
      ;;
  esac
done
"#;

/// Like SERVER_SCRIPT, but the process dies right after answering one call.
const DYING_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      exit 0
      ;;
  esac
done
"#;

/// Answers the handshake, then exits as soon as a call arrives.
const BROKEN_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      exit 0
      ;;
  esac
done
"#;

fn write_script(dir: &tempfile::TempDir, name: &str, script: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, script).unwrap();
    path
}

fn script_config(name: &str, script: &PathBuf, env: serde_json::Value) -> ServerConfig {
    serde_json::from_value(json!({
        "name": name,
        "type": "process",
        "enabled": true,
        "command": "sh",
        "args": [script.to_str().unwrap()],
        "env": env
    }))
    .unwrap()
}

#[tokio::test]
async fn process_server_lists_and_calls_tools() {
    std::env::set_var("TOOL_RELAY_TEST_STDIO_E2E_TAG", "alpha");
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "server.sh", SERVER_SCRIPT);
    let config = script_config(
        "echo",
        &script,
        json!({"RELAY_TAG": "${TOOL_RELAY_TEST_STDIO_E2E_TAG}"}),
    );

    let handler = StdioHandler::new(StdioKind::Process, config).unwrap();

    let tools = handler.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "ping");

    // The env placeholder resolved against the live host environment.
    let result = handler.call_tool("ping", json!({})).await.unwrap();
    assert_eq!(result[0]["text"], "pong from alpha");

    handler.disconnect().await.unwrap();
    // Idempotent.
    handler.disconnect().await.unwrap();
}

#[tokio::test]
async fn conflicting_tool_names_route_to_their_owners() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "server.sh", SERVER_SCRIPT);
    let configs = [
        script_config("echo", &script, json!({"RELAY_TAG": "one"})),
        script_config("echo2", &script, json!({"RELAY_TAG": "two"})),
    ];

    let output = tempfile::tempdir().unwrap();
    let mut manager = McpManager::with_output_dir(output.path().to_path_buf());
    manager.initialize(&configs).await;

    // First writer keeps the bare name, the second is disambiguated.
    assert_eq!(manager.get_tool("ping").unwrap().server_name, "echo");
    let renamed = manager.get_tool("echo2_ping").unwrap();
    assert_eq!(renamed.server_name, "echo2");
    assert_eq!(renamed.original_name, "ping");

    let first = manager.call_tool("ping", json!({})).await.unwrap();
    assert_eq!(first[0]["text"], "pong from one");
    let second = manager.call_tool("echo2_ping", json!({})).await.unwrap();
    assert_eq!(second[0]["text"], "pong from two");

    manager.cleanup().await;
}

#[tokio::test]
async fn one_failing_server_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "server.sh", SERVER_SCRIPT);
    let good = script_config("good", &script, json!({}));
    let bad: ServerConfig = serde_json::from_value(json!({
        "name": "bad",
        "type": "process",
        "enabled": true,
        "command": "tool-relay-no-such-command-470281"
    }))
    .unwrap();

    let output = tempfile::tempdir().unwrap();
    let mut manager = McpManager::with_output_dir(output.path().to_path_buf());
    manager.initialize(&[bad, good]).await;

    assert_eq!(manager.get_tool("ping").unwrap().server_name, "good");
    assert!(manager.tools_for_server("bad").is_empty());

    manager.cleanup().await;
}

#[tokio::test]
async fn connection_loss_triggers_a_single_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "dying.sh", DYING_SERVER_SCRIPT);
    let config = script_config("flaky", &script, json!({}));

    let handler = StdioHandler::new(StdioKind::Process, config).unwrap();
    handler.connect().await.unwrap();

    // First call succeeds, then the server exits.
    let result = handler.call_tool("ping", json!({})).await.unwrap();
    assert_eq!(result[0]["text"], "pong");

    // The dead connection is detected and recovered once, transparently.
    let result = handler.call_tool("ping", json!({})).await.unwrap();
    assert_eq!(result[0]["text"], "pong");

    handler.disconnect().await.unwrap();
}

#[tokio::test]
async fn persistent_failure_propagates_after_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "broken.sh", BROKEN_SERVER_SCRIPT);
    let config = script_config("hopeless", &script, json!({}));

    let handler = StdioHandler::new(StdioKind::Process, config).unwrap();
    handler.connect().await.unwrap();

    // Both the original attempt and the single retry hit a dead pipe; the
    // error surfaces instead of looping forever.
    let err = handler.call_tool("ping", json!({})).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error class: {:?}", err);

    handler.disconnect().await.unwrap();
}
