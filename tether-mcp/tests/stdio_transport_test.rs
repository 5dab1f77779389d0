//! Line-delimited JSON over an in-process pipe, driven byte by byte

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf};
use tokio::io::DuplexStream;
use tokio::time::timeout;

use tether_mcp::{demo, McpServer, McpServerConfig, StdioTransport, TransportOptions};

const WAIT: Duration = Duration::from_secs(5);

async fn next_frame(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> Result<Value> {
    let line = timeout(WAIT, lines.next_line())
        .await??
        .ok_or_else(|| anyhow::anyhow!("server closed its output"))?;
    Ok(serde_json::from_str(&line)?)
}

#[tokio::test]
async fn test_stdio_unknown_tool_malformed_lines_and_eof() -> Result<()> {
    let (client, server_end) = duplex(64 * 1024);
    let (server_read, server_write) = split(server_end);
    let (client_read, mut client_write) = split(client);
    let mut lines = BufReader::new(client_read).lines();

    let server = McpServer::new(McpServerConfig::default());
    demo::register(&server).await?;
    let transport = StdioTransport::new(server_read, server_write, TransportOptions::default());
    let session = server.serve(Arc::new(transport)).await?;

    // Unregistered tool: an error response, not a crash
    client_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"missing\",\"arguments\":{}}}\n")
        .await?;
    let response = next_frame(&mut lines).await?;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["error"]["code"], json!(-32601));
    assert!(response.get("result").is_none());

    // Unparseable line without an id is dropped; a structurally invalid one
    // with an id gets an InvalidRequest answer
    client_write.write_all(b"{not json at all\n").await?;
    client_write.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7}\n").await?;
    let response = next_frame(&mut lines).await?;
    assert_eq!(response["id"], json!(7));
    assert_eq!(response["error"]["code"], json!(-32600));

    // Still serving; CRLF line endings are accepted
    client_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"p\",\"method\":\"ping\"}\r\n")
        .await?;
    let response = next_frame(&mut lines).await?;
    assert_eq!(response, json!({"jsonrpc": "2.0", "id": "p", "result": {}}));

    // EOF on input ends the session
    client_write.shutdown().await?;
    drop(client_write);
    timeout(WAIT, session.closed()).await?;
    assert!(session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_stdio_tools_call_round_trip() -> Result<()> {
    let (client, server_end) = duplex(64 * 1024);
    let (server_read, server_write) = split(server_end);
    let (client_read, mut client_write) = split(client);
    let mut lines = BufReader::new(client_read).lines();

    let server = McpServer::new(McpServerConfig::default());
    demo::register(&server).await?;
    server
        .serve(Arc::new(StdioTransport::new(
            server_read,
            server_write,
            TransportOptions::default(),
        )))
        .await?;

    let request = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {"name": "hello", "arguments": {"name": "Grace"}}
    });
    client_write
        .write_all(format!("{}\n", request).as_bytes())
        .await?;

    let response = next_frame(&mut lines).await?;
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["result"]["isError"], json!(false));
    assert_eq!(
        response["result"]["content"][0]["text"],
        json!("Hello, Grace! Tool executed successfully.")
    );

    // Notifications never produce output: the next frame answers the ping
    client_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
        .await?;
    client_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n")
        .await?;
    let response = next_frame(&mut lines).await?;
    assert_eq!(response["id"], json!(3));

    server.shutdown().await;
    Ok(())
}
