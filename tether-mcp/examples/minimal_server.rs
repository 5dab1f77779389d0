//! Minimal MCP server example
//!
//! Serves one `echo` tool over SSE and streamable HTTP on the same port.
//!
//! Run with: cargo run --example minimal_server

use std::sync::Arc;
use tether_mcp::{
    middleware::{PanicRecovery, RequestLogging},
    prelude::*,
    server::mcp_routes,
    McpError,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tether_logging::init_simple_tracing("info")?;

    let server = McpServer::new(McpServerConfig::new("Minimal MCP Server", "1.0.0"));
    server.use_middleware(Arc::new(PanicRecovery::new())).await;
    server.use_middleware(Arc::new(RequestLogging::new())).await;

    server
        .register_tool(
            Tool::new(
                "echo",
                "Echo back the input message",
                InputSchema::object()
                    .property("message", Property::string("The message to echo back"))
                    .require("message"),
            ),
            handler_fn(|_context, request: CallToolRequest| async move {
                match request.str_argument("message") {
                    Some(message) => Ok(CallToolResult::text(format!("Echo: {}", message))),
                    None => Err(McpError::ToolExecution {
                        tool: request.name.clone(),
                        message: "Missing or invalid 'message' parameter".to_string(),
                    }),
                }
            }),
        )
        .await?;

    let app = axum::Router::new().merge(mcp_routes(server.clone()));

    println!("Starting MCP server on http://127.0.0.1:3000");
    println!("Endpoints:");
    println!("  GET  /sse     - SSE event stream");
    println!("  POST /message - SSE message endpoint");
    println!("  POST /mcp     - Streamable HTTP requests");
    println!();
    println!("Try testing with:");
    println!("  curl -X POST http://localhost:3000/mcp \\");
    println!("    -H 'Content-Type: application/json' \\");
    println!("    -d '{{\"jsonrpc\":\"2.0\",\"method\":\"tools/list\",\"id\":1}}'");

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            // Ends open event streams so the listener can drain
            server.shutdown().await;
        })
        .await?;

    Ok(())
}
