//! Correlation, cancellation and fault containment across a live session

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use tether_mcp::protocol::CancelledParams;
use tether_mcp::transport::InboundStream;
use tether_mcp::{
    demo, handler_fn, CallOptions, CallToolRequest, CallToolResult, InputSchema, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, McpClient, McpError, McpResult, McpServer, McpServerConfig,
    McpTransport, MemoryTransport, RequestContext, RequestHandler, RequestId, Session,
    SessionConfig, Tool,
};

const WAIT: Duration = Duration::from_secs(5);

struct Quiet;

#[async_trait]
impl RequestHandler for Quiet {
    async fn handle_request(&self, request: JsonRpcRequest, _context: RequestContext) -> McpResult<Value> {
        Err(McpError::MethodNotFound {
            method: request.method,
        })
    }
}

/// A session on one end and the raw transport on the other
async fn session_with_raw_peer() -> Result<(Session, MemoryTransport, InboundStream)> {
    let (left, right) = MemoryTransport::pair();
    let session = Session::start(Arc::new(left), Arc::new(Quiet), SessionConfig::default()).await?;
    right.start().await?;
    let inbound = right.incoming().await?;
    Ok((session, right, inbound))
}

async fn next_message(inbound: &mut InboundStream) -> Result<JsonRpcMessage> {
    let item = timeout(WAIT, inbound.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("peer stream ended"))?;
    Ok(item?)
}

async fn next_request(inbound: &mut InboundStream) -> Result<JsonRpcRequest> {
    match next_message(inbound).await? {
        JsonRpcMessage::Request(request) => Ok(request),
        other => anyhow::bail!("expected a request, got {:?}", other),
    }
}

async fn next_response(inbound: &mut InboundStream) -> Result<JsonRpcResponse> {
    match next_message(inbound).await? {
        JsonRpcMessage::Response(response) => Ok(response),
        other => anyhow::bail!("expected a response, got {:?}", other),
    }
}

fn delayed_tool(name: &'static str, delay: Duration) -> (Tool, Arc<dyn tether_mcp::ToolHandler>) {
    (
        Tool::new(name, "", InputSchema::object()),
        handler_fn(move |_, _| async move {
            sleep(delay).await;
            Ok(CallToolResult::text(name))
        }),
    )
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    for (name, millis) in [("slow", 300), ("medium", 150), ("fast", 0)] {
        let (tool, handler) = delayed_tool(name, Duration::from_millis(millis));
        server.register_tool(tool, handler).await?;
    }

    let (client_end, server_end) = MemoryTransport::pair();
    server.serve(Arc::new(server_end)).await?;
    let client = McpClient::connect(Arc::new(client_end)).await?;

    let (slow, medium, fast) = timeout(WAIT, async {
        tokio::join!(
            client.call_tool("slow", Map::new()),
            client.call_tool("medium", Map::new()),
            client.call_tool("fast", Map::new()),
        )
    })
    .await?;

    assert_eq!(slow?.joined_text(), "slow");
    assert_eq!(medium?.joined_text(), "medium");
    assert_eq!(fast?.joined_text(), "fast");
    assert_eq!(client.session().pending_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_call_discards_late_response() -> Result<()> {
    let (session, peer, mut inbound) = session_with_raw_peer().await?;

    let token = CancellationToken::new();
    let caller = session.clone();
    let call_token = token.clone();
    let call = tokio::spawn(async move {
        caller
            .call("work", None, CallOptions::default().with_cancellation(call_token))
            .await
    });

    let request = next_request(&mut inbound).await?;
    assert_eq!(request.method, "work");
    let id = request.id.clone().expect("request id");
    assert_eq!(session.pending_calls().await, 1);

    token.cancel();
    let outcome = timeout(WAIT, call).await??;
    assert!(matches!(outcome, Err(McpError::Cancelled { .. })));
    assert_eq!(session.pending_calls().await, 0);

    // The peer is told, best effort
    let notice = next_request(&mut inbound).await?;
    assert_eq!(notice.method, "notifications/cancelled");
    let params: CancelledParams = serde_json::from_value(notice.params.unwrap_or_default())?;
    assert_eq!(params.request_id, id);

    // A late response is dropped quietly and the session carries on
    peer.send(JsonRpcResponse::success(json!({"late": true}), Some(id)).into())
        .await?;

    let caller = session.clone();
    let follow_up = tokio::spawn(async move { caller.call("again", None, CallOptions::default()).await });
    let request = next_request(&mut inbound).await?;
    peer.send(JsonRpcResponse::success(json!("fresh"), request.id).into())
        .await?;
    assert_eq!(timeout(WAIT, follow_up).await???, json!("fresh"));
    assert!(!session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_timeout_surfaces_client_timeout() -> Result<()> {
    let (session, _peer, mut inbound) = session_with_raw_peer().await?;

    let err = timeout(
        WAIT,
        session.call(
            "never",
            None,
            CallOptions::default().with_timeout(Duration::from_millis(50)),
        ),
    )
    .await?
    .unwrap_err();
    assert!(matches!(err, McpError::ClientTimeout { .. }));
    assert_eq!(session.pending_calls().await, 0);

    let _request = next_request(&mut inbound).await?;
    let notice = next_request(&mut inbound).await?;
    assert_eq!(notice.method, "notifications/cancelled");
    Ok(())
}

#[tokio::test]
async fn test_peer_close_fails_pending_calls() -> Result<()> {
    let (session, peer, mut inbound) = session_with_raw_peer().await?;

    let caller = session.clone();
    let call = tokio::spawn(async move { caller.call("hang", None, CallOptions::default()).await });
    let _request = next_request(&mut inbound).await?;

    peer.close().await?;
    let outcome = timeout(WAIT, call).await??;
    assert!(matches!(outcome, Err(McpError::ConnectionClosed { .. })));
    timeout(WAIT, session.closed()).await?;
    Ok(())
}

#[tokio::test]
async fn test_panicking_tool_is_contained() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    demo::register(&server).await?;
    server
        .register_tool(
            Tool::new("boom", "", InputSchema::object()),
            handler_fn(|_, request: CallToolRequest| async move {
                if request.name == "boom" {
                    panic!("tool exploded");
                }
                Ok(CallToolResult::text("unreachable"))
            }),
        )
        .await?;

    let (client_end, server_end) = MemoryTransport::pair();
    let session = server.serve(Arc::new(server_end)).await?;
    let client = McpClient::connect(Arc::new(client_end)).await?;

    let err = timeout(WAIT, client.call_tool("boom", Map::new())).await?.unwrap_err();
    match err {
        McpError::Remote { error } => {
            assert_eq!(error.code, -32603);
            assert!(!error.message.contains("exploded"));
        }
        other => panic!("expected handler fault, got {:?}", other),
    }

    let result = timeout(WAIT, client.call_tool("hello", Map::new())).await??;
    assert_eq!(result.joined_text(), "Hello, World! Tool executed successfully.");
    assert!(!session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_in_flight_id_rejected() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    let (tool, handler) = delayed_tool("slow", Duration::from_millis(200));
    server.register_tool(tool, handler).await?;

    let (raw, server_end) = MemoryTransport::pair();
    server.serve(Arc::new(server_end)).await?;
    raw.start().await?;
    let mut inbound = raw.incoming().await?;

    let call = || {
        JsonRpcRequest::with_id(
            "tools/call",
            Some(json!({"name": "slow", "arguments": {}})),
            RequestId::Number(1),
        )
    };
    raw.send(call().into()).await?;
    raw.send(call().into()).await?;

    let first = next_response(&mut inbound).await?;
    assert_eq!(first.id, Some(RequestId::Number(1)));
    assert_eq!(first.error.map(|e| e.code), Some(-32600));

    let second = next_response(&mut inbound).await?;
    assert!(second.is_success());
    Ok(())
}

#[tokio::test]
async fn test_inbound_cancellation_suppresses_response() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    let (tool, handler) = delayed_tool("slow", Duration::from_secs(30));
    server.register_tool(tool, handler).await?;

    let (raw, server_end) = MemoryTransport::pair();
    let session = server.serve(Arc::new(server_end)).await?;
    raw.start().await?;
    let mut inbound = raw.incoming().await?;

    raw.send(
        JsonRpcRequest::with_id(
            "tools/call",
            Some(json!({"name": "slow"})),
            RequestId::String("job".to_string()),
        )
        .into(),
    )
    .await?;

    timeout(WAIT, async {
        while session.in_flight().await == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    raw.send(
        JsonRpcRequest::notification(
            "notifications/cancelled",
            Some(json!({"requestId": "job", "reason": "user"})),
        )
        .into(),
    )
    .await?;
    raw.send(JsonRpcRequest::with_id("ping", None, RequestId::Number(2)).into())
        .await?;

    // Only the ping is answered
    let response = next_response(&mut inbound).await?;
    assert_eq!(response.id, Some(RequestId::Number(2)));

    timeout(WAIT, async {
        while session.in_flight().await > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}
