//! Deadline for the remaining chain

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::{McpError, McpResult};

/// Fails with `McpError::ServerTimeout` when everything below takes too long
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl ToolMiddleware for Timeout {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        let tool = request.name.clone();
        match tokio::time::timeout(self.duration, next.run(context, request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(tool = %tool, timeout = ?self.duration, "tool call timed out");
                Err(McpError::ServerTimeout {
                    timeout: self.duration,
                })
            }
        }
    }
}
