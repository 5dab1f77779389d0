//! Axum endpoints for the HTTP transports
//!
//! * SSE: `GET {base}/sse` opens the event stream, `POST {base}/message?sessionId=<id>`
//!   delivers one envelope.
//! * Streamable HTTP: `POST`, `GET` and `DELETE` on `{base}/mcp`.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{codec, JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcResponse};
use crate::server::config::HttpMode;
use crate::server::service::McpServer;
use crate::transport::{
    HttpSessionManager, McpTransport, SseServerTransport, StatefulHttpTransport,
    StatelessHttpTransport, MCP_SESSION_ID_HEADER,
};
use crate::McpError;

#[derive(Clone)]
struct SseState {
    server: McpServer,
    message_path: String,
    sessions: Arc<RwLock<HashMap<String, Arc<SseServerTransport>>>>,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Routes for the SSE transport
pub fn sse_routes(server: McpServer) -> Router {
    let http = server.config().http.clone();
    let body_limit = server.config().transport.max_message_size;
    let state = SseState {
        server,
        message_path: http.route("message"),
        sessions: Arc::new(RwLock::new(HashMap::new())),
    };

    Router::new()
        .route(&http.route("sse"), get(sse_connect))
        .route(&http.route("message"), post(sse_message))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn sse_connect(State(state): State<SseState>) -> Result<Response, McpError> {
    let session_id = Uuid::new_v4().to_string();
    let transport = Arc::new(SseServerTransport::new(
        session_id.clone(),
        state.server.config().transport.clone(),
    ));

    let endpoint = format!("{}?sessionId={}", state.message_path, session_id);
    let stream = transport.event_stream(endpoint).await?;
    let session = state
        .server
        .serve_with_id(session_id.clone(), transport.clone() as Arc<dyn McpTransport>)
        .await?;

    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), transport);

    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        session.closed().await;
        sessions.write().await.remove(session.id());
        debug!(session_id = %session.id(), "SSE session removed");
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

async fn sse_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let transport = state.sessions.read().await.get(&query.session_id).cloned();
    let Some(transport) = transport else {
        return unknown_session(&query.session_id);
    };

    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(decode) => {
            debug!(session_id = %query.session_id, error = %decode, "rejecting undecodable POST body");
            return (StatusCode::BAD_REQUEST, Json(decode.to_response())).into_response();
        }
    };

    match transport.deliver(Ok(message)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(session_id = %query.session_id, error = %e, "failed to queue SSE message");
            e.into_response()
        }
    }
}

#[derive(Clone)]
struct StreamableState {
    server: McpServer,
    mode: HttpMode,
    sessions: Arc<HttpSessionManager>,
}

impl StreamableState {
    /// Upper bound on waiting for a response to a POSTed request
    fn reply_deadline(&self) -> Duration {
        let config = self.server.config();
        config.request_timeout + config.transport.send_timeout
    }
}

/// Routes for streamable HTTP in the configured mode.
///
/// In stateful mode this spawns the idle-session cleanup task, so it must be
/// called from within a Tokio runtime.
pub fn streamable_http_routes(server: McpServer) -> Router {
    let config = server.config().clone();
    let sessions = Arc::new(HttpSessionManager::new(
        config.transport.clone(),
        config.http.idle_timeout,
        config.http.cleanup_interval,
    ));
    if config.http.mode == HttpMode::Stateful {
        sessions.start_cleanup_task(server.shutdown_token());
    }

    let state = StreamableState {
        server,
        mode: config.http.mode,
        sessions,
    };

    Router::new()
        .route(
            &config.http.route("mcp"),
            post(mcp_post).get(mcp_get).delete(mcp_delete),
        )
        .layer(DefaultBodyLimit::max(config.transport.max_message_size))
        .with_state(state)
}

/// SSE and streamable HTTP routes on one router
pub fn mcp_routes(server: McpServer) -> Router {
    sse_routes(server.clone()).merge(streamable_http_routes(server))
}

async fn mcp_post(State(state): State<StreamableState>, headers: HeaderMap, body: Bytes) -> Response {
    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(decode) => {
            debug!(error = %decode, "rejecting undecodable POST body");
            return (StatusCode::BAD_REQUEST, Json(decode.to_response())).into_response();
        }
    };

    match state.mode {
        HttpMode::Stateless => stateless_exchange(&state, message).await,
        HttpMode::Stateful => stateful_exchange(&state, &headers, message).await,
    }
}

async fn stateless_exchange(state: &StreamableState, message: JsonRpcMessage) -> Response {
    let request_id = message.id().cloned().filter(|_| message.is_request());
    let (transport, reply) = StatelessHttpTransport::new(message);
    let transport = Arc::new(transport);
    if let Err(e) = state.server.serve(transport.clone()).await {
        return e.into_response_for(request_id);
    }
    if request_id.is_none() {
        return StatusCode::ACCEPTED.into_response();
    }

    match tokio::time::timeout(state.reply_deadline(), reply).await {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(_)) => McpError::Internal {
            message: "exchange ended without a response".to_string(),
        }
        .into_response_for(request_id),
        Err(_) => {
            let _ = transport.close().await;
            McpError::ServerTimeout {
                timeout: state.reply_deadline(),
            }
            .into_response_for(request_id)
        }
    }
}

async fn stateful_exchange(state: &StreamableState, headers: &HeaderMap, message: JsonRpcMessage) -> Response {
    let transport = match session_header(headers) {
        Some(session_id) => match state.sessions.get(session_id).await {
            Some(transport) => transport,
            None => return unknown_session(session_id),
        },
        None => match open_session(state).await {
            Ok(transport) => transport,
            Err(e) => return e.into_response(),
        },
    };

    let request_id = message.id().cloned().filter(|_| message.is_request());
    let response = match request_id {
        Some(id) => {
            let waiter = transport.expect_response(id.clone()).await;
            match transport.deliver(Ok(message)).await {
                Err(e) => {
                    transport.forget_response(&id).await;
                    e.into_response_for(Some(id))
                }
                Ok(()) => match tokio::time::timeout(state.reply_deadline(), waiter).await {
                    Ok(Ok(reply)) => Json(reply).into_response(),
                    Ok(Err(_)) => McpError::ConnectionClosed {
                        reason: "session ended before responding".to_string(),
                    }
                    .into_response_for(Some(id)),
                    Err(_) => {
                        transport.forget_response(&id).await;
                        McpError::ServerTimeout {
                            timeout: state.reply_deadline(),
                        }
                        .into_response_for(Some(id))
                    }
                },
            }
        }
        None => match transport.deliver(Ok(message)).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => e.into_response(),
        },
    };

    with_session_id(response, transport.session_id())
}

async fn open_session(state: &StreamableState) -> Result<Arc<StatefulHttpTransport>, McpError> {
    let transport = state.sessions.create().await;
    let session_id = transport.session_id().to_string();
    let served = state
        .server
        .serve_with_id(session_id.clone(), transport.clone() as Arc<dyn McpTransport>)
        .await;

    if let Err(e) = served {
        state.sessions.remove(&session_id).await;
        return Err(e);
    }
    Ok(transport)
}

async fn mcp_get(State(state): State<StreamableState>, headers: HeaderMap) -> Response {
    if state.mode == HttpMode::Stateless {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(session_id) = session_header(&headers) else {
        return missing_session();
    };
    let Some(transport) = state.sessions.get(session_id).await else {
        return unknown_session(session_id);
    };

    match transport.attach_stream() {
        Ok(stream) => with_session_id(
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response(),
            transport.session_id(),
        ),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(JsonRpcResponse::error(e.to_jsonrpc_error(), None)),
        )
            .into_response(),
    }
}

async fn mcp_delete(State(state): State<StreamableState>, headers: HeaderMap) -> Response {
    if state.mode == HttpMode::Stateless {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(session_id) = session_header(&headers) else {
        return missing_session();
    };

    match state.sessions.remove(session_id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => unknown_session(session_id),
    }
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn with_session_id(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), value);
    }
    response
}

fn unknown_session(session_id: &str) -> Response {
    let error = JsonRpcError::new(
        JsonRpcErrorCode::InvalidRequest as i32,
        format!("Unknown session: {}", session_id),
        None,
    );
    (StatusCode::NOT_FOUND, Json(JsonRpcResponse::error(error, None))).into_response()
}

fn missing_session() -> Response {
    let error = JsonRpcError::new(
        JsonRpcErrorCode::InvalidRequest as i32,
        format!("Missing {} header", MCP_SESSION_ID_HEADER),
        None,
    );
    (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::error(error, None))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::McpServerConfig;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn request(method: Method, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_stateless_ping_answered_in_body() {
        let app = streamable_http_routes(McpServer::new(McpServerConfig::default()));
        let response = app
            .oneshot(request(Method::POST, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(MCP_SESSION_ID_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_stateless_rejects_get_and_bad_bodies() {
        let app = streamable_http_routes(McpServer::new(McpServerConfig::default()));

        let response = app.clone().oneshot(request(Method::GET, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app.clone().oneshot(request(Method::POST, "{nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request(Method::POST, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_stateful_issues_session_and_rejects_unknown() {
        let mut config = McpServerConfig::default();
        config.http.mode = HttpMode::Stateful;
        let app = streamable_http_routes(McpServer::new(config));

        let response = app
            .clone()
            .oneshot(request(Method::POST, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(MCP_SESSION_ID_HEADER).is_some());

        let mut unknown = request(Method::POST, r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#);
        unknown
            .headers_mut()
            .insert(MCP_SESSION_ID_HEADER, HeaderValue::from_static("missing"));
        let response = app.clone().oneshot(unknown).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(request(Method::DELETE, "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sse_message_for_unknown_session() {
        let app = sse_routes(McpServer::new(McpServerConfig::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/message?sessionId=nobody")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
