//! Middleware composition through a live server and client

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use tether_mcp::middleware::{ArgumentTokenAuth, PanicRecovery, RequestLogging, ToolMetrics};
use tether_mcp::{
    demo, handler_fn, middleware_fn, CallToolRequest, CallToolResult, InputSchema, McpClient,
    McpError, McpServer, McpServerConfig, MemoryTransport, Next, Tool, ToolMiddleware,
};

const WAIT: Duration = Duration::from_secs(5);

type Trace = Arc<Mutex<Vec<String>>>;

async fn connect(server: &McpServer) -> Result<McpClient> {
    let (client_end, server_end) = MemoryTransport::pair();
    server.serve(Arc::new(server_end)).await?;
    let client = McpClient::connect(Arc::new(client_end)).await?;
    timeout(WAIT, client.initialize()).await??;
    Ok(client)
}

fn recording(label: &'static str, trace: Trace) -> Arc<dyn ToolMiddleware> {
    middleware_fn(label, move |context, request, next: Next| {
        let trace = Arc::clone(&trace);
        async move {
            trace.lock().unwrap().push(format!("pre:{}", label));
            let outcome = next.run(context, request).await;
            trace.lock().unwrap().push(format!("post:{}", label));
            outcome
        }
    })
}

/// Records each call's outcome the way a logging layer would see it
fn outcome_log(outcomes: Trace) -> Arc<dyn ToolMiddleware> {
    middleware_fn("outcome_log", move |context, request: CallToolRequest, next: Next| {
        let outcomes = Arc::clone(&outcomes);
        async move {
            let tool = request.name.clone();
            let outcome = next.run(context, request).await;
            let entry = match &outcome {
                Ok(_) => format!("{}:ok", tool),
                Err(McpError::Unauthorized { .. }) => format!("{}:Unauthorized", tool),
                Err(other) => format!("{}:{}", tool, other),
            };
            outcomes.lock().unwrap().push(entry);
            outcome
        }
    })
}

fn arguments(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn test_globals_wrap_per_tool_middlewares() -> Result<()> {
    let trace: Trace = Arc::default();
    let server = McpServer::new(McpServerConfig::default());
    server.use_middleware(recording("A", Arc::clone(&trace))).await;
    server.use_middleware(recording("B", Arc::clone(&trace))).await;

    let handler_trace = Arc::clone(&trace);
    server
        .register_tool_with(
            Tool::new("traced", "", InputSchema::object()),
            handler_fn(move |_, _| {
                let trace = Arc::clone(&handler_trace);
                async move {
                    trace.lock().unwrap().push("H".to_string());
                    Ok(CallToolResult::text("done"))
                }
            }),
            vec![recording("C", Arc::clone(&trace)), recording("D", Arc::clone(&trace))],
        )
        .await?;

    let client = connect(&server).await?;
    let result = timeout(WAIT, client.call_tool("traced", Map::new())).await??;
    assert_eq!(result.joined_text(), "done");

    let trace = trace.lock().unwrap().clone();
    assert_eq!(
        trace,
        [
            "pre:A", "pre:B", "pre:C", "pre:D", "H", "post:D", "post:C", "post:B", "post:A"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_short_circuit_skips_inner_layers() -> Result<()> {
    let trace: Trace = Arc::default();
    let server = McpServer::new(McpServerConfig::default());
    server.use_middleware(recording("A", Arc::clone(&trace))).await;
    server.use_middleware(recording("B", Arc::clone(&trace))).await;

    let gate_trace = Arc::clone(&trace);
    let gate = middleware_fn("C", move |_, _, _next: Next| {
        let trace = Arc::clone(&gate_trace);
        async move {
            trace.lock().unwrap().push("C".to_string());
            Ok(CallToolResult::text("from C"))
        }
    });

    let handler_trace = Arc::clone(&trace);
    server
        .register_tool_with(
            Tool::new("gated", "", InputSchema::object()),
            handler_fn(move |_, _| {
                let trace = Arc::clone(&handler_trace);
                async move {
                    trace.lock().unwrap().push("H".to_string());
                    Ok(CallToolResult::text("from H"))
                }
            }),
            vec![gate, recording("D", Arc::clone(&trace))],
        )
        .await?;

    let client = connect(&server).await?;
    let result = timeout(WAIT, client.call_tool("gated", Map::new())).await??;
    assert_eq!(result.joined_text(), "from C");
    assert_eq!(
        trace.lock().unwrap().clone(),
        ["pre:A", "pre:B", "C", "post:B", "post:A"]
    );
    Ok(())
}

#[tokio::test]
async fn test_hello_scenario_with_token_auth() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    let metrics = ToolMetrics::new();
    let outcomes: Trace = Arc::default();
    server.use_middleware(Arc::new(PanicRecovery::new())).await;
    server.use_middleware(Arc::new(RequestLogging::new())).await;
    server
        .use_middleware(outcome_log(Arc::clone(&outcomes)))
        .await;
    server
        .use_middleware(Arc::new(ArgumentTokenAuth::new(["secret"])))
        .await;
    server.use_middleware(Arc::new(metrics.clone())).await;
    demo::register(&server).await?;

    let client = connect(&server).await?;

    let tools = timeout(WAIT, client.list_tools()).await??;
    let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(names, ["counter", "hello"]);

    let result = timeout(
        WAIT,
        client.call_tool("hello", arguments(&[("auth_token", json!("secret"))])),
    )
    .await??;
    assert!(!result.is_error);
    assert_eq!(result.joined_text(), "Hello, World! Tool executed successfully.");

    for bad in [arguments(&[]), arguments(&[("auth_token", json!("wrong"))])] {
        let err = timeout(WAIT, client.call_tool("hello", bad)).await?.unwrap_err();
        match err {
            McpError::Remote { error } => {
                assert_eq!(error.code, -32001);
                assert_eq!(error.message, "Unauthorized");
            }
            other => panic!("expected unauthorized, got {:?}", other),
        }
    }

    // The logging position sees every outcome, rejections included
    assert_eq!(
        outcomes.lock().unwrap().clone(),
        ["hello:ok", "hello:Unauthorized", "hello:Unauthorized"]
    );

    // Auth sits above metrics: only the authorized call reached it
    let stats = metrics.stats("hello").await.expect("hello stats");
    assert_eq!((stats.calls, stats.successes, stats.failures), (1, 1, 0));
    Ok(())
}

#[tokio::test]
async fn test_metrics_observe_rejected_calls_when_outermost() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    let metrics = ToolMetrics::new();
    server.use_middleware(Arc::new(metrics.clone())).await;
    server
        .use_middleware(Arc::new(ArgumentTokenAuth::new(["secret"])))
        .await;
    demo::register(&server).await?;

    let client = connect(&server).await?;
    let outcome = timeout(WAIT, client.call_tool("hello", Map::new())).await?;
    assert!(outcome.is_err());

    let stats = metrics.stats("hello").await.expect("hello stats");
    assert_eq!((stats.calls, stats.failures), (1, 1));
    Ok(())
}

#[tokio::test]
async fn test_middleware_can_rewrite_arguments() -> Result<()> {
    let server = McpServer::new(McpServerConfig::default());
    server
        .use_middleware(middleware_fn("default_name", |context, mut request: CallToolRequest, next: Next| async move {
            request
                .arguments
                .entry("name".to_string())
                .or_insert_with(|| json!("Middleware"));
            next.run(context, request).await
        }))
        .await;
    demo::register(&server).await?;

    let client = connect(&server).await?;
    let result = timeout(WAIT, client.call_tool("hello", Map::new())).await??;
    assert_eq!(result.joined_text(), "Hello, Middleware! Tool executed successfully.");
    Ok(())
}
