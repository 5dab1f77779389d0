//! Tool-invoking side of a session

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::protocol::{
    CallToolResult, Implementation, InitializeParams, InitializeResult, JsonRpcRequest, McpMethod,
    Tool, ToolsCallParams, ToolsListResult, MCP_PROTOCOL_VERSION,
};
use crate::session::{CallOptions, RequestContext, RequestHandler, Session, SessionConfig};
use crate::transport::{McpTransport, TransportFactory, TransportOptions, TransportType};
use crate::{McpError, McpResult};

/// Buffered server notifications per subscriber before the oldest are dropped
const NOTIFICATION_BUFFER: usize = 64;

/// MCP client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpClientConfig {
    /// Client name sent in `initialize`
    #[serde(default = "default_name")]
    pub name: String,

    /// Client version sent in `initialize`
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transport: TransportOptions,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            protocol_version: default_protocol_version(),
            session: SessionConfig::default(),
            transport: TransportOptions::default(),
        }
    }
}

fn default_name() -> String {
    "tether-mcp-client".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_protocol_version() -> String {
    MCP_PROTOCOL_VERSION.to_string()
}

/// Answers server pings and fans server notifications out to subscribers
struct ClientHandler {
    notifications: broadcast::Sender<JsonRpcRequest>,
}

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle_request(&self, request: JsonRpcRequest, _context: RequestContext) -> McpResult<Value> {
        match McpMethod::parse(&request.method) {
            Some(McpMethod::Ping) => Ok(json!({})),
            _ => Err(McpError::MethodNotFound {
                method: request.method,
            }),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcRequest, context: RequestContext) -> McpResult<()> {
        debug!(session_id = %context.session_id, method = %notification.method, "server notification");
        // No subscribers is fine
        let _ = self.notifications.send(notification);
        Ok(())
    }
}

/// MCP client bound to one session
pub struct McpClient {
    session: Session,
    config: McpClientConfig,
    notifications: broadcast::Sender<JsonRpcRequest>,
    server: RwLock<Option<InitializeResult>>,
}

impl McpClient {
    /// Start a session over `transport` with default settings
    pub async fn connect(transport: Arc<dyn McpTransport>) -> McpResult<Self> {
        Self::connect_with(transport, McpClientConfig::default()).await
    }

    pub async fn connect_with(transport: Arc<dyn McpTransport>, config: McpClientConfig) -> McpResult<Self> {
        config.session.validate()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let handler = Arc::new(ClientHandler {
            notifications: notifications.clone(),
        });

        let session = Session::start(transport, handler, config.session.clone()).await?;
        debug!(session_id = %session.id(), "client session started");

        Ok(Self {
            session,
            config,
            notifications,
            server: RwLock::new(None),
        })
    }

    /// Build the transport described by `transport` and connect over it
    pub async fn connect_to(transport: TransportType, config: McpClientConfig) -> McpResult<Self> {
        let kind = transport.type_name();
        let transport = TransportFactory::create(transport, config.transport.clone())?;
        let client = Self::connect_with(transport, config).await?;
        info!(session_id = %client.session.id(), transport = kind, "connected to MCP server");
        Ok(client)
    }

    /// Handshake, then announce `notifications/initialized`
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: json!({}),
            client_info: Some(Implementation::new(&self.config.name, &self.config.version)),
        };

        let value = self
            .session
            .call(
                McpMethod::Initialize.as_str(),
                Some(serde_json::to_value(params)?),
                CallOptions::default(),
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        self.session
            .notify(McpMethod::Initialized.as_str(), None)
            .await?;
        info!(
            session_id = %self.session.id(),
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "initialized"
        );

        *self.server.write().await = Some(result.clone());
        Ok(result)
    }

    /// Result of the last successful `initialize`
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server.read().await.clone()
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.session
            .call(McpMethod::Ping.as_str(), None, CallOptions::default())
            .await
            .map(|_| ())
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let value = self
            .session
            .call(McpMethod::ToolsList.as_str(), None, CallOptions::default())
            .await?;
        let result: ToolsListResult = serde_json::from_value(value)?;
        Ok(result.tools)
    }

    /// Call a tool with the session's default deadline
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> McpResult<CallToolResult> {
        self.call_tool_with(name, arguments, CallOptions::default())
            .await
    }

    pub async fn call_tool_with(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        options: CallOptions,
    ) -> McpResult<CallToolResult> {
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments: Some(Value::Object(arguments)),
        };
        let value = self
            .session
            .call(
                McpMethod::ToolsCall.as_str(),
                Some(serde_json::to_value(params)?),
                options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.session.notify(method, params).await
    }

    /// Subscribe to notifications the server sends on this session
    pub fn notifications(&self) -> broadcast::Receiver<JsonRpcRequest> {
        self.notifications.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Fail outstanding calls and close the transport
    pub async fn close(&self) {
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler_fn;
    use crate::protocol::{CallToolRequest, InputSchema, Property};
    use crate::server::{McpServer, McpServerConfig};
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected() -> (McpServer, McpClient) {
        let server = McpServer::new(McpServerConfig::new("test-server", "1.2.3"));
        server
            .register_tool(
                Tool::new(
                    "greet",
                    "Greets someone",
                    InputSchema::object().property("name", Property::string("who")),
                ),
                handler_fn(|_, request: CallToolRequest| async move {
                    let name = request.str_argument("name").unwrap_or("World").to_string();
                    Ok(CallToolResult::text(format!("Hello, {}!", name)))
                }),
            )
            .await
            .unwrap();

        let (client_end, server_end) = MemoryTransport::pair();
        server.serve(Arc::new(server_end)).await.unwrap();
        let client = McpClient::connect(Arc::new(client_end)).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_initialize_list_and_call() {
        let (_server, client) = connected().await;

        let init = timeout(Duration::from_secs(5), client.initialize()).await.unwrap().unwrap();
        assert_eq!(init.server_info, Implementation::new("test-server", "1.2.3"));
        assert_eq!(init.protocol_version, MCP_PROTOCOL_VERSION);
        assert!(client.server_info().await.is_some());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");

        let mut arguments = Map::new();
        arguments.insert("name".to_string(), json!("Ada"));
        let result = timeout(Duration::from_secs(5), client.call_tool("greet", arguments))
            .await
            .unwrap()
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "Hello, Ada!");

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_is_remote_error() {
        let (_server, client) = connected().await;
        let err = timeout(Duration::from_secs(5), client.call_tool("nope", Map::new()))
            .await
            .unwrap()
            .unwrap_err();
        match err {
            McpError::Remote { error } => assert_eq!(error.code, -32601),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let (server, client) = connected().await;
        timeout(Duration::from_secs(5), client.close()).await.unwrap();
        assert!(client.session().is_closed());
        assert!(client.ping().await.is_err());

        timeout(Duration::from_secs(5), async {
            while server.session_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
