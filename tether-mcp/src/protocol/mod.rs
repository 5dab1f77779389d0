//! Wire protocol: JSON-RPC envelopes, the codec and MCP message payloads

pub mod codec;
pub mod jsonrpc;
pub mod messages;

pub use codec::{decode, decode_value, encode, encode_line, DecodeError, DecodeErrorKind};
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId,
    JSONRPC_VERSION,
};
pub use messages::{
    CallToolRequest, CallToolResult, CancelledParams, Content, Implementation, InitializeParams,
    InitializeResult, InputSchema, McpMethod, Property, PropertyType, ServerCapabilities, Tool,
    ToolsCallParams, ToolsCapability, ToolsListResult,
};

/// Protocol revision announced by default
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Revisions this implementation can speak, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Echo the client's revision when supported, otherwise offer `preferred`
pub fn negotiate_protocol_version(requested: &str, preferred: &str) -> String {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
        requested.to_string()
    } else {
        preferred.to_string()
    }
}
