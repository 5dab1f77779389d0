//! # Tether MCP: transports, sessions and tool dispatch
//!
//! This crate carries MCP-style JSON-RPC 2.0 traffic between a tool-serving
//! process and a tool-invoking process. It provides the wire codec, several
//! interchangeable transports, a session that correlates concurrent calls by
//! id, a composable middleware chain around every tool, and Axum handlers for
//! the HTTP transports.
//!
//! ## Features
//!
//! - **Transports** - in-memory pairs, stdio (own process or a spawned child),
//!   SSE and streamable HTTP (stateless and stateful), all behind [`McpTransport`]
//! - **Sessions** - pending-call table with timeouts and cancellation,
//!   concurrent servicing of inbound requests, drain on peer close
//! - **Middleware** - panic recovery, request logging, argument-token auth,
//!   metrics, rate limiting and timeouts, plus closures via [`middleware_fn`]
//! - **Fault containment** - a panicking tool becomes a `-32603` error
//!   response; the session keeps serving
//! - **Axum integration** - [`server::mcp_routes`] mounts every HTTP endpoint
//!
//! ## Quick Start
//!
//! ### Serving a tool over stdio
//!
//! ```rust,no_run
//! use tether_mcp::{handler_fn, CallToolResult, InputSchema, McpServer, McpServerConfig, Property, Tool};
//!
//! #[tokio::main]
//! async fn main() -> tether_mcp::McpResult<()> {
//!     let server = McpServer::new(McpServerConfig::new("greeter", "1.0.0"));
//!     server
//!         .register_tool(
//!             Tool::new(
//!                 "greet",
//!                 "Say hello",
//!                 InputSchema::object().property("name", Property::string("Who to greet")),
//!             ),
//!             handler_fn(|_context, request| async move {
//!                 let name = request.str_argument("name").unwrap_or("World").to_string();
//!                 Ok(CallToolResult::text(format!("Hello, {}!", name)))
//!             }),
//!         )
//!         .await?;
//!
//!     server.run_stdio().await
//! }
//! ```
//!
//! ### Serving over HTTP
//!
//! ```rust,no_run
//! use tether_mcp::{server::mcp_routes, McpServer, McpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = McpServer::new(McpServerConfig::default());
//!     let app = axum::Router::new().merge(mcp_routes(server));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Calling tools
//!
//! ```rust,no_run
//! use serde_json::{json, Map};
//! use tether_mcp::{McpClient, McpClientConfig, TransportType};
//!
//! # async fn example() -> tether_mcp::McpResult<()> {
//! let client = McpClient::connect_to(
//!     TransportType::StreamableHttp {
//!         url: "http://127.0.0.1:8080/mcp".to_string(),
//!         headers: Default::default(),
//!         auth: None,
//!         timeout: std::time::Duration::from_secs(30),
//!         push_stream: true,
//!     },
//!     McpClientConfig::default(),
//! )
//! .await?;
//!
//! client.initialize().await?;
//! let mut arguments = Map::new();
//! arguments.insert("name".to_string(), json!("Ada"));
//! let result = client.call_tool("greet", arguments).await?;
//! println!("{}", result.joined_text());
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod demo;
pub mod error;
pub mod middleware;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::{McpClient, McpClientConfig};
pub use config::McpConfig;
pub use error::{McpError, McpResult};

pub use protocol::{
    CallToolRequest, CallToolResult, Content, InputSchema, JsonRpcError, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, McpMethod, Property, RequestId, Tool, MCP_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};

pub use middleware::{
    handler_fn, middleware_fn, Chain, Next, ToolExecutionContext, ToolHandler, ToolMiddleware,
};

pub use server::{HttpConfig, HttpMode, McpServer, McpServerConfig, ToolRegistry};

pub use session::{CallOptions, RequestContext, RequestHandler, Session, SessionConfig};

pub use transport::{
    McpTransport, MemoryTransport, StdioTransport, TransportFactory, TransportOptions,
    TransportType,
};

// Convenience re-exports for common use cases
pub mod prelude {
    //! Commonly used types and traits

    pub use crate::{
        error::{McpError, McpResult},
        middleware::{handler_fn, middleware_fn, Next, ToolExecutionContext, ToolHandler, ToolMiddleware},
        protocol::{CallToolRequest, CallToolResult, InputSchema, Property, Tool},
        server::{McpServer, McpServerConfig},
        transport::{McpTransport, TransportType},
        McpClient,
    };

    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_crate_exports() {
        let _error: McpError = McpError::Internal {
            message: "test".to_string(),
        };
        assert!(crate::SUPPORTED_PROTOCOL_VERSIONS.contains(&crate::MCP_PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn test_prelude_builds_a_server() {
        let server = McpServer::new(McpServerConfig::default());
        server
            .register_tool(
                Tool::new("noop", "", InputSchema::object()),
                handler_fn(|_, _| async { Ok(CallToolResult::text("")) }),
            )
            .await
            .unwrap();
        assert_eq!(server.registry().len().await, 1);
    }
}
