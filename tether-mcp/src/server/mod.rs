//! Tool-serving side: registry, dispatcher and HTTP endpoints

pub mod config;
pub mod handler;
pub mod registry;
pub mod service;

pub use config::{HttpConfig, HttpMode, McpServerConfig};
pub use handler::{mcp_routes, sse_routes, streamable_http_routes};
pub use registry::ToolRegistry;
pub use service::{Dispatcher, McpServer};
