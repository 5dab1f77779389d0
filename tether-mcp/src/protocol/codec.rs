//! Envelope codec
//!
//! `encode` and `decode` are pure; transports add their own framing (a
//! trailing newline for stdio, `data:` lines for SSE, a request body for
//! HTTP).

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use super::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};
use crate::error::McpResult;

/// Why an inbound frame could not be turned into an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Not JSON at all
    Parse,
    /// JSON, but not a valid JSON-RPC envelope
    InvalidRequest,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::Parse => f.write_str("parse error"),
            DecodeErrorKind::InvalidRequest => f.write_str("invalid request"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
    /// Id of the offending envelope, when it could be read
    pub id: Option<RequestId>,
}

impl DecodeError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: DecodeErrorKind::Parse,
            message: message.into(),
            id: None,
        }
    }

    pub fn invalid(message: impl Into<String>, id: Option<RequestId>) -> Self {
        Self {
            kind: DecodeErrorKind::InvalidRequest,
            message: message.into(),
            id,
        }
    }

    /// Error response addressed to the offending id (or null)
    pub fn to_response(&self) -> JsonRpcResponse {
        let data = Some(Value::String(self.message.clone()));
        let error = match self.kind {
            DecodeErrorKind::Parse => JsonRpcError::parse_error(data),
            DecodeErrorKind::InvalidRequest => JsonRpcError::invalid_request(data),
        };
        JsonRpcResponse::error(error, self.id.clone())
    }
}

/// Serialize one envelope without framing
pub fn encode(message: &JsonRpcMessage) -> McpResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Serialize one envelope followed by `\n`
pub fn encode_line(message: &JsonRpcMessage) -> McpResult<Vec<u8>> {
    let mut bytes = encode(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse and validate one envelope
pub fn decode(bytes: &[u8]) -> Result<JsonRpcMessage, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::parse(e.to_string()))?;
    decode_value(value)
}

/// Validate an already parsed JSON document as an envelope
pub fn decode_value(value: Value) -> Result<JsonRpcMessage, DecodeError> {
    let Value::Object(mut object) = value else {
        return Err(DecodeError::invalid("envelope must be a JSON object", None));
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_id(raw)?),
    };

    match object.remove("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        Some(other) => {
            return Err(DecodeError::invalid(
                format!("unsupported jsonrpc version {}", other),
                id,
            ))
        }
        None => return Err(DecodeError::invalid("missing jsonrpc version", id)),
    }

    let method = object.remove("method");
    let result = object.remove("result");
    let error = object.remove("error");

    match (method, result, error) {
        (Some(method), None, None) => decode_request(method, &mut object, id),
        (None, Some(result), None) => match id {
            Some(id) => Ok(JsonRpcResponse::success(result, Some(id)).into()),
            None => Err(DecodeError::invalid("result response is missing its id", None)),
        },
        (None, None, Some(error)) => {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|e| DecodeError::invalid(format!("malformed error object: {}", e), id.clone()))?;
            Ok(JsonRpcResponse::error(error, id).into())
        }
        (None, None, None) => Err(DecodeError::invalid(
            "envelope carries none of method, result or error",
            id,
        )),
        (None, Some(_), Some(_)) => Err(DecodeError::invalid(
            "response carries both result and error",
            id,
        )),
        _ => Err(DecodeError::invalid(
            "envelope mixes request and response members",
            id,
        )),
    }
}

fn decode_request(
    method: Value,
    object: &mut Map<String, Value>,
    id: Option<RequestId>,
) -> Result<JsonRpcMessage, DecodeError> {
    let Value::String(method) = method else {
        return Err(DecodeError::invalid("method must be a string", id));
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(_) => {
            return Err(DecodeError::invalid(
                "params must be an object or an array",
                id,
            ))
        }
    };

    Ok(JsonRpcRequest::new(method, params, id).into())
}

fn parse_id(raw: Value) -> Result<RequestId, DecodeError> {
    match raw {
        Value::String(id) => Ok(RequestId::String(id)),
        Value::Number(number) => number
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| DecodeError::invalid("numeric request id must be an integer", None)),
        _ => Err(DecodeError::invalid(
            "request id must be an integer or a string",
            None,
        )),
    }
}
