//! Panic isolation for everything below this middleware

use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::error;

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::{McpError, McpResult};

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Turns a panic below it into `McpError::HandlerFault`
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicRecovery;

impl PanicRecovery {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolMiddleware for PanicRecovery {
    fn name(&self) -> &str {
        "panic_recovery"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        let tool = request.name.clone();
        match AssertUnwindSafe(next.run(context, request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tool = %tool, panic = %message, "tool handler panicked");
                Err(McpError::HandlerFault { tool, message })
            }
        }
    }
}
