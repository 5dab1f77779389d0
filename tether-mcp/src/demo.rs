//! Demo tools served by the `tether-mcp` binary

use serde_json::Value;

use crate::middleware::handler_fn;
use crate::protocol::{CallToolRequest, CallToolResult, InputSchema, Property, Tool};
use crate::server::McpServer;
use crate::McpResult;

/// Argument the demo tools expect the caller's token in
pub const AUTH_FIELD: &str = "auth_token";

pub fn hello_tool() -> Tool {
    Tool::new(
        "hello",
        "Greets the caller",
        InputSchema::object()
            .property("name", Property::string("Who to greet, defaults to World"))
            .property(AUTH_FIELD, Property::string("Access token"))
            .require(AUTH_FIELD),
    )
}

pub fn counter_tool() -> Tool {
    Tool::new(
        "counter",
        "Count something",
        InputSchema::object()
            .property("count", Property::number("Number to count, defaults to 1"))
            .property(AUTH_FIELD, Property::string("Access token"))
            .require(AUTH_FIELD),
    )
}

pub fn tools() -> Vec<Tool> {
    vec![hello_tool(), counter_tool()]
}

pub fn greeting(name: &str) -> String {
    format!("Hello, {}! Tool executed successfully.", name)
}

/// `count` as an integer; fractions truncate, anything non-numeric counts as 1
fn count_of(request: &CallToolRequest) -> i64 {
    match request.argument("count") {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .unwrap_or(1),
        _ => 1,
    }
}

pub fn counter_message(count: i64) -> String {
    format!("Counter value: {}", count)
}

/// Register `hello` and `counter` on `server`
pub async fn register(server: &McpServer) -> McpResult<()> {
    server
        .register_tool(
            hello_tool(),
            handler_fn(|_, request: CallToolRequest| async move {
                let name = request.str_argument("name").unwrap_or("World");
                Ok(CallToolResult::text(greeting(name)))
            }),
        )
        .await?;

    server
        .register_tool(
            counter_tool(),
            handler_fn(|_, request: CallToolRequest| async move {
                Ok(CallToolResult::text(counter_message(count_of(&request))))
            }),
        )
        .await
}
