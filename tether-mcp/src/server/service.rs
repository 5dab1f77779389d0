//! Core MCP server implementation

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::middleware::{panic_message, ToolExecutionContext, ToolHandler, ToolMiddleware};
use crate::protocol::{
    negotiate_protocol_version, CallToolRequest, CallToolResult, Implementation, InitializeParams,
    InitializeResult, JsonRpcRequest, McpMethod, ServerCapabilities, Tool, ToolsCallParams,
    ToolsListResult,
};
use crate::server::config::McpServerConfig;
use crate::server::registry::ToolRegistry;
use crate::session::{RequestContext, RequestHandler, Session};
use crate::transport::{McpTransport, StdioTransport};
use crate::{McpError, McpResult};

/// Routes inbound MCP methods to the registry
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    config: McpServerConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: McpServerConfig) -> Self {
        Self { registry, config }
    }

    fn initialize(&self, params: Option<Value>) -> McpResult<InitializeResult> {
        let params: InitializeParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::InvalidParams {
                message: format!("invalid initialize params: {}", e),
            })?
            .ok_or_else(|| McpError::InvalidParams {
                message: "initialize requires params".to_string(),
            })?;

        let protocol_version =
            negotiate_protocol_version(&params.protocol_version, &self.config.protocol_version);
        info!(
            client = ?params.client_info.as_ref().map(|client| client.name.as_str()),
            requested = %params.protocol_version,
            negotiated = %protocol_version,
            "client initializing"
        );

        Ok(InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities::default().with_tools(false),
            server_info: Implementation::new(&self.config.name, &self.config.version),
        })
    }

    /// Run one `tools/call` through the tool's chain inside the fault boundary
    pub async fn call_tool(
        &self,
        params: Option<Value>,
        context: &RequestContext,
    ) -> McpResult<CallToolResult> {
        let params: ToolsCallParams = match params {
            Some(params) => serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
                message: format!("invalid tools/call params: {}", e),
            })?,
            None => {
                return Err(McpError::InvalidParams {
                    message: "tools/call requires params".to_string(),
                })
            }
        };
        let arguments = match params.arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments,
            Some(_) => {
                return Err(McpError::InvalidParams {
                    message: "tools/call arguments must be an object".to_string(),
                })
            }
        };

        let (_, chain) = self.registry.lookup(&params.name).await?;
        let tool = params.name;
        let request = CallToolRequest {
            name: tool.clone(),
            arguments,
        };
        let tool_context = ToolExecutionContext {
            session_id: context.session_id.clone(),
            request_id: context.request_id.clone(),
            cancellation: context.cancellation.clone(),
            metadata: HashMap::new(),
            peer: Some(context.peer.clone()),
        };

        let guarded = AssertUnwindSafe(chain.call(tool_context, request)).catch_unwind();
        let outcome = match tokio::time::timeout(self.config.request_timeout, guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!(tool = %tool, panic = %message, "tool panicked outside any recovery middleware");
                Err(McpError::HandlerFault {
                    tool: tool.clone(),
                    message,
                })
            }
            Err(_) => Err(McpError::ServerTimeout {
                timeout: self.config.request_timeout,
            }),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(McpError::ToolExecution { message, .. }) => {
                debug!(tool = %tool, error = %message, "tool reported failure");
                Ok(CallToolResult::error_text(message))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle_request(&self, request: JsonRpcRequest, context: RequestContext) -> McpResult<Value> {
        debug!(
            session_id = %context.session_id,
            request_id = ?context.request_id,
            method = %request.method,
            "handling request"
        );

        match McpMethod::parse(&request.method) {
            Some(McpMethod::Initialize) => Ok(serde_json::to_value(self.initialize(request.params)?)?),
            Some(McpMethod::Ping) => Ok(json!({})),
            Some(McpMethod::ToolsList) => Ok(serde_json::to_value(ToolsListResult {
                tools: self.registry.list().await,
            })?),
            Some(McpMethod::ToolsCall) => {
                let result = self.call_tool(request.params, &context).await?;
                Ok(serde_json::to_value(result)?)
            }
            _ => Err(McpError::MethodNotFound {
                method: request.method,
            }),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcRequest, context: RequestContext) -> McpResult<()> {
        match McpMethod::parse(&notification.method) {
            Some(McpMethod::Initialized) => {
                debug!(session_id = %context.session_id, "client finished initialization")
            }
            _ => debug!(
                session_id = %context.session_id,
                method = %notification.method,
                "ignoring notification"
            ),
        }
        Ok(())
    }
}

struct ServerInner {
    config: McpServerConfig,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    sessions: RwLock<HashMap<String, Session>>,
    shutdown: CancellationToken,
}

/// MCP server: one registry, any number of sessions over any transports
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    pub fn new(config: McpServerConfig) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), config.clone()));
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                dispatcher,
                sessions: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub async fn register_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) -> McpResult<()> {
        self.inner.registry.register(tool, handler, Vec::new()).await
    }

    /// Register with middlewares that run inside the global ones
    pub async fn register_tool_with(
        &self,
        tool: Tool,
        handler: Arc<dyn ToolHandler>,
        middlewares: Vec<Arc<dyn ToolMiddleware>>,
    ) -> McpResult<()> {
        self.inner.registry.register(tool, handler, middlewares).await
    }

    pub async fn unregister_tool(&self, name: &str) -> McpResult<Tool> {
        self.inner.registry.unregister(name).await
    }

    /// Append a global middleware; the first one added is outermost
    pub async fn use_middleware(&self, middleware: Arc<dyn ToolMiddleware>) {
        self.inner.registry.use_middleware(middleware).await
    }

    /// Start a session over `transport` under a fresh id
    pub async fn serve(&self, transport: Arc<dyn McpTransport>) -> McpResult<Session> {
        self.serve_with_id(Uuid::new_v4().to_string(), transport).await
    }

    pub async fn serve_with_id(
        &self,
        session_id: impl Into<String>,
        transport: Arc<dyn McpTransport>,
    ) -> McpResult<Session> {
        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::Session {
                message: "server is shutting down".to_string(),
            });
        }

        let handler: Arc<dyn RequestHandler> = self.inner.dispatcher.clone();
        let session = Session::start_with_id(
            session_id,
            transport,
            handler,
            self.inner.config.session.clone(),
        )
        .await?;

        let session_id = session.id().to_string();
        self.inner
            .sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        debug!(session_id = %session_id, "serving session");

        let server: Weak<ServerInner> = Arc::downgrade(&self.inner);
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(server) = server.upgrade() {
                server.sessions.write().await.remove(watched.id());
            }
        });

        Ok(session)
    }

    /// Serve one transport until its session ends
    pub async fn run(&self, transport: Arc<dyn McpTransport>) -> McpResult<()> {
        let session = self.serve(transport).await?;
        session.closed().await;
        Ok(())
    }

    /// Serve this process's stdin/stdout until EOF or shutdown
    pub async fn run_stdio(&self) -> McpResult<()> {
        let transport = StdioTransport::stdio(self.inner.config.transport.clone());
        self.run(Arc::new(transport)).await
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Fires once `shutdown` has been requested
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuse new sessions and shut down every live one
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<Session> = self.inner.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "shutting down MCP server");
        join_all(sessions.iter().map(|session| session.shutdown())).await;
    }
}
