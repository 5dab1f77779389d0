//! Tool invocation middleware
//!
//! A [`Chain`] wraps a tool's terminal [`ToolHandler`] in the server's global
//! middlewares followed by the tool's own. With globals `[g1, g2]` and
//! per-tool `[p1]` the effective call is `g1(g2(p1(handler)))`.
//!
//! A middleware receives the request and a [`Next`] handle. It may rewrite the
//! request before calling `next`, rewrite the outcome afterwards, or return
//! without calling `next` at all; in that case nothing below it runs and
//! everything above it sees its outcome.

pub mod auth;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;
pub mod timeout;

pub use auth::ArgumentTokenAuth;
pub use logging::RequestLogging;
pub use metrics::{ToolMetrics, ToolStats};
pub use rate_limit::{RateLimit, RateLimitConfig, RateLimitKey, RateLimiter};
pub use recovery::{panic_message, PanicRecovery};
pub use timeout::Timeout;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{CallToolRequest, CallToolResult, RequestId};
use crate::session::Session;
use crate::McpResult;

/// Per-call information handed down the chain
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionContext {
    pub session_id: String,
    pub request_id: Option<RequestId>,
    /// Fires when the caller cancels or the session shuts down
    pub cancellation: CancellationToken,
    /// Scratch space for middlewares to pass data inward
    pub metadata: HashMap<String, Value>,
    /// Session the call arrived on, for server-initiated messages
    pub peer: Option<Session>,
}

impl ToolExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_peer(mut self, peer: Session) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Terminal tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn call(&self, context: ToolExecutionContext, request: CallToolRequest) -> McpResult<CallToolResult>;
}

/// Interceptor around a tool invocation
#[async_trait]
pub trait ToolMiddleware: Send + Sync + 'static {
    /// Short label used in logs
    fn name(&self) -> &str {
        "middleware"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult>;
}

/// The rest of the chain below a middleware
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn ToolHandler>,
}

impl Next {
    pub async fn run(self, context: ToolExecutionContext, request: CallToolRequest) -> McpResult<CallToolResult> {
        self.inner.call(context, request).await
    }
}

struct Layer {
    middleware: Arc<dyn ToolMiddleware>,
    next: Next,
}

#[async_trait]
impl ToolHandler for Layer {
    async fn call(&self, context: ToolExecutionContext, request: CallToolRequest) -> McpResult<CallToolResult> {
        self.middleware.handle(context, request, self.next.clone()).await
    }
}

/// Composed middlewares plus the terminal handler of one tool.
///
/// Immutable once built; in-flight calls keep their own `Arc` while the
/// registry swaps in rebuilt chains.
#[derive(Clone)]
pub struct Chain {
    entry: Arc<dyn ToolHandler>,
    layers: Vec<String>,
}

impl Chain {
    pub fn build(
        globals: &[Arc<dyn ToolMiddleware>],
        per_tool: &[Arc<dyn ToolMiddleware>],
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        let mut entry = handler;
        for middleware in globals.iter().chain(per_tool).rev() {
            entry = Arc::new(Layer {
                middleware: Arc::clone(middleware),
                next: Next { inner: entry },
            });
        }

        Self {
            entry,
            layers: globals
                .iter()
                .chain(per_tool)
                .map(|middleware| middleware.name().to_string())
                .collect(),
        }
    }

    pub async fn call(&self, context: ToolExecutionContext, request: CallToolRequest) -> McpResult<CallToolResult> {
        self.entry.call(context, request).await
    }

    /// Number of middlewares around the handler
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Middleware names, outermost first
    pub fn layers(&self) -> &[String] {
        &self.layers
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("layers", &self.layers).finish()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolExecutionContext, CallToolRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
{
    async fn call(&self, context: ToolExecutionContext, request: CallToolRequest) -> McpResult<CallToolResult> {
        (self.0)(context, request).await
    }
}

/// Use an async closure as a tool handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolExecutionContext, CallToolRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> ToolMiddleware for FnMiddleware<F>
where
    F: Fn(ToolExecutionContext, CallToolRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        (self.f)(context, request, next).await
    }
}

/// Use an async closure as a middleware
pub fn middleware_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn ToolMiddleware>
where
    F: Fn(ToolExecutionContext, CallToolRequest, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<CallToolResult>> + Send + 'static,
{
    Arc::new(FnMiddleware { name: name.into(), f })
}
