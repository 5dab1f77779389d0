//! Structured start/finish logging around tool calls

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::McpResult;

const REDACTED: &str = "[REDACTED]";

/// Logs each call's arguments and its outcome with the elapsed time.
///
/// Arguments named in the redaction list are masked.
#[derive(Debug, Clone)]
pub struct RequestLogging {
    redact: HashSet<String>,
}

impl Default for RequestLogging {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLogging {
    pub fn new() -> Self {
        Self {
            redact: ["auth_token", "password", "secret", "token"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn redact(mut self, field: impl Into<String>) -> Self {
        self.redact.insert(field.into());
        self
    }

    fn loggable_arguments(&self, request: &CallToolRequest) -> Value {
        let masked = request
            .arguments
            .iter()
            .map(|(key, value)| {
                let value = if self.redact.contains(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect();
        Value::Object(masked)
    }
}

#[async_trait]
impl ToolMiddleware for RequestLogging {
    fn name(&self) -> &str {
        "request_logging"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        let tool = request.name.clone();
        let session_id = context.session_id.clone();
        let request_id = context.request_id.clone();
        info!(
            tool = %tool,
            session_id = %session_id,
            request_id = ?request_id,
            arguments = %self.loggable_arguments(&request),
            "tool call started"
        );

        let started = Instant::now();
        let outcome = next.run(context, request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(result) if !result.is_error => {
                info!(tool = %tool, session_id = %session_id, request_id = ?request_id, duration_ms, "tool call succeeded")
            }
            Ok(_) => {
                warn!(tool = %tool, session_id = %session_id, request_id = ?request_id, duration_ms, "tool reported an error")
            }
            Err(e) => {
                warn!(tool = %tool, session_id = %session_id, request_id = ?request_id, duration_ms, error = %e, "tool call failed")
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, Chain};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_secrets_are_masked() {
        let logging = RequestLogging::new().redact("api_key");
        let request = CallToolRequest::new("hello")
            .with_argument("auth_token", json!("secret"))
            .with_argument("api_key", json!("k"))
            .with_argument("name", json!("World"));

        assert_eq!(
            logging.loggable_arguments(&request),
            json!({"auth_token": REDACTED, "api_key": REDACTED, "name": "World"})
        );
    }

    #[tokio::test]
    async fn test_outcome_passes_through() {
        let handler = handler_fn(|_, _| async { Ok(CallToolResult::error_text("nope")) });
        let chain = Chain::build(&[Arc::new(RequestLogging::new())], &[], handler);
        let result = chain
            .call(ToolExecutionContext::default(), CallToolRequest::new("t"))
            .await
            .unwrap();
        assert!(result.is_error);
    }
}
