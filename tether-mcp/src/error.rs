//! Error types for MCP operations

use crate::protocol::{DecodeError, JsonRpcError, JsonRpcErrorCode, RequestId};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// MCP error types
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McpError {
    /// Transport-related errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The transport or session is gone
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Protocol errors (invalid JSON-RPC, etc.)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Envelope was well formed JSON but not a valid request
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// Tool not found
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// Request id already in flight on this session
    #[error("Duplicate request id: {id}")]
    DuplicateRequestId { id: RequestId },

    /// Tool execution errors, reported to callers as `isError` results
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    /// A handler panicked and the panic was trapped
    #[error("Handler fault in {tool}: {message}")]
    HandlerFault { tool: String, message: String },

    /// Authentication failed
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Rate limit exceeded with details
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Server timeout
    #[error("Server timeout after {timeout:?}")]
    ServerTimeout { timeout: Duration },

    /// Client timeout
    #[error("Client timeout after {timeout:?}")]
    ClientTimeout { timeout: Duration },

    /// The caller cancelled a pending call
    #[error("Request {id} cancelled")]
    Cancelled { id: RequestId },

    /// Error envelope returned by the peer
    #[error("Remote error: {error}")]
    Remote { error: JsonRpcError },

    #[error("Tool already registered: {name}")]
    DuplicateTool { name: String },

    #[error("Invalid input schema for tool '{tool}': {message}")]
    InvalidSchema { tool: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Session errors
    #[error("Session error: {message}")]
    Session { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal server errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl McpError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            McpError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            McpError::ToolNotFound { .. } => StatusCode::NOT_FOUND,
            McpError::MethodNotFound { .. } => StatusCode::NOT_FOUND,
            McpError::Protocol { .. } => StatusCode::BAD_REQUEST,
            McpError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            McpError::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            McpError::InvalidSchema { .. } => StatusCode::BAD_REQUEST,
            McpError::Configuration { .. } => StatusCode::BAD_REQUEST,
            McpError::DuplicateRequestId { .. } => StatusCode::CONFLICT,
            McpError::DuplicateTool { .. } => StatusCode::CONFLICT,
            McpError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            McpError::ServerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            McpError::ClientTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            McpError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            McpError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            McpError::ConnectionClosed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            McpError::Remote { .. } => StatusCode::BAD_GATEWAY,
            McpError::ToolExecution { .. }
            | McpError::HandlerFault { .. }
            | McpError::Session { .. }
            | McpError::Io { .. }
            | McpError::Serialization { .. }
            | McpError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for JSON-RPC responses
    pub fn error_code(&self) -> i32 {
        match self {
            McpError::Protocol { .. } => JsonRpcErrorCode::InvalidRequest as i32,
            McpError::InvalidRequest { .. } => JsonRpcErrorCode::InvalidRequest as i32,
            McpError::DuplicateRequestId { .. } => JsonRpcErrorCode::InvalidRequest as i32,
            McpError::MethodNotFound { .. } => JsonRpcErrorCode::MethodNotFound as i32,
            McpError::ToolNotFound { .. } => JsonRpcErrorCode::MethodNotFound as i32,
            McpError::InvalidParams { .. } => JsonRpcErrorCode::InvalidParams as i32,
            McpError::Serialization { .. } => JsonRpcErrorCode::ParseError as i32,
            McpError::Unauthorized { .. } => JsonRpcErrorCode::Unauthorized as i32,
            McpError::RateLimitExceeded { .. } => JsonRpcErrorCode::ServerError as i32,
            McpError::ToolExecution { .. } => JsonRpcErrorCode::ServerError as i32,
            McpError::ServerTimeout { .. } => JsonRpcErrorCode::ServerError as i32,
            McpError::Cancelled { .. } => JsonRpcErrorCode::RequestCancelled as i32,
            McpError::Remote { error } => error.code,
            _ => JsonRpcErrorCode::InternalError as i32,
        }
    }

    /// Create a sanitized error message for external clients
    pub fn client_message(&self) -> String {
        match self {
            McpError::Unauthorized { .. } => "Unauthorized".to_string(),
            McpError::ToolNotFound { name } => format!("Tool '{}' not found", name),
            McpError::MethodNotFound { method } => format!("Method '{}' not found", method),
            McpError::InvalidParams { message } => message.clone(),
            McpError::InvalidRequest { message } => message.clone(),
            McpError::Protocol { message } => message.clone(),
            McpError::DuplicateRequestId { id } => format!("Request id {} is already in flight", id),
            McpError::ToolExecution { message, .. } => message.clone(),
            McpError::HandlerFault { .. } => "Internal error in tool handler".to_string(),
            McpError::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            McpError::ServerTimeout { .. } => "Request timeout".to_string(),
            McpError::ClientTimeout { .. } => "Request timeout".to_string(),
            McpError::Cancelled { .. } => "Request cancelled".to_string(),
            McpError::Remote { error } => error.message.clone(),
            _ => "Internal server error".to_string(),
        }
    }

    /// True for errors that mean the session's transport is unusable
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::ConnectionClosed { .. } | McpError::Io { .. }
        )
    }

    /// Error object placed in a JSON-RPC error response
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            McpError::Remote { error } => error.clone(),
            McpError::RateLimitExceeded {
                retry_after: Some(retry_after),
                ..
            } => JsonRpcError::new(
                self.error_code(),
                self.client_message(),
                Some(json!({ "retryAfterSecs": retry_after.as_secs_f64() })),
            ),
            McpError::ToolNotFound { name } => JsonRpcError::new(
                self.error_code(),
                self.client_message(),
                Some(json!({ "tool": name })),
            ),
            McpError::Io { .. }
            | McpError::Transport { .. }
            | McpError::Session { .. }
            | McpError::Internal { .. }
            | McpError::HandlerFault { .. } => {
                JsonRpcError::new(self.error_code(), self.client_message(), None)
            }
            _ => JsonRpcError::new(
                self.error_code(),
                self.client_message(),
                Some(serde_json::Value::String(self.to_string())),
            ),
        }
    }
}

impl McpError {
    /// HTTP error response whose JSON-RPC body is correlated to `id`
    pub fn into_response_for(self, id: Option<RequestId>) -> Response {
        let status = self.status_code();
        let body = crate::protocol::JsonRpcResponse::error(self.to_jsonrpc_error(), id);
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for McpError {
    fn into_response(self) -> Response {
        self.into_response_for(None)
    }
}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        McpError::Remote { error }
    }
}

impl From<DecodeError> for McpError {
    fn from(err: DecodeError) -> Self {
        McpError::Protocol {
            message: err.to_string(),
        }
    }
}

// Standard error conversions
impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for McpError {
    fn from(err: url::ParseError) -> Self {
        McpError::Configuration {
            message: format!("Invalid URL: {}", err),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport {
            message: format!("HTTP request failed: {}", err),
        }
    }
}

impl From<anyhow::Error> for McpError {
    fn from(err: anyhow::Error) -> Self {
        McpError::Internal {
            message: err.to_string(),
        }
    }
}
