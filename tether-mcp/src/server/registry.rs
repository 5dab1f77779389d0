//! Tool registry owned by one server

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::middleware::{Chain, ToolHandler, ToolMiddleware};
use crate::protocol::Tool;
use crate::{McpError, McpResult};

struct RegisteredTool {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
    middlewares: Vec<Arc<dyn ToolMiddleware>>,
    chain: Chain,
}

#[derive(Default)]
struct RegistryState {
    tools: HashMap<String, RegisteredTool>,
    globals: Vec<Arc<dyn ToolMiddleware>>,
}

/// Tools by name, each with its cached middleware chain.
///
/// Lookups share the lock; registration and global middleware changes take
/// it exclusively. Re-registering a name is rejected; `unregister` first.
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the schema and add the tool behind the current global middlewares
    pub async fn register(
        &self,
        tool: Tool,
        handler: Arc<dyn ToolHandler>,
        middlewares: Vec<Arc<dyn ToolMiddleware>>,
    ) -> McpResult<()> {
        tool.validate()?;

        let mut state = self.state.write().await;
        if state.tools.contains_key(&tool.name) {
            return Err(McpError::DuplicateTool { name: tool.name });
        }

        let chain = Chain::build(&state.globals, &middlewares, Arc::clone(&handler));
        info!(tool = %tool.name, layers = chain.depth(), "registered tool");
        state.tools.insert(
            tool.name.clone(),
            RegisteredTool {
                tool,
                handler,
                middlewares,
                chain,
            },
        );
        Ok(())
    }

    /// Remove a tool; returns its descriptor
    pub async fn unregister(&self, name: &str) -> McpResult<Tool> {
        let removed = self.state.write().await.tools.remove(name);
        match removed {
            Some(registered) => {
                info!(tool = %name, "unregistered tool");
                Ok(registered.tool)
            }
            None => Err(McpError::ToolNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Descriptor and chain for `name`
    pub async fn lookup(&self, name: &str) -> McpResult<(Tool, Chain)> {
        let state = self.state.read().await;
        state
            .tools
            .get(name)
            .map(|registered| (registered.tool.clone(), registered.chain.clone()))
            .ok_or_else(|| McpError::ToolNotFound {
                name: name.to_string(),
            })
    }

    /// All descriptors, sorted by name
    pub async fn list(&self) -> Vec<Tool> {
        let state = self.state.read().await;
        let mut tools: Vec<Tool> = state.tools.values().map(|registered| registered.tool.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Append a global middleware and rebuild every chain
    pub async fn use_middleware(&self, middleware: Arc<dyn ToolMiddleware>) {
        let mut state = self.state.write().await;
        state.globals.push(middleware);

        let RegistryState { tools, globals } = &mut *state;
        for registered in tools.values_mut() {
            registered.chain = Chain::build(
                globals,
                &registered.middlewares,
                Arc::clone(&registered.handler),
            );
        }
        debug!(globals = globals.len(), tools = tools.len(), "rebuilt tool chains");
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.tools.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, middleware_fn, Next, ToolExecutionContext};
    use crate::protocol::{CallToolRequest, CallToolResult, InputSchema, Property};

    fn tool(name: &str) -> Tool {
        Tool::new(
            name,
            format!("{} tool", name),
            InputSchema::object().property("name", Property::string("who")),
        )
    }

    fn echo() -> Arc<dyn ToolHandler> {
        handler_fn(|_, request: CallToolRequest| async move { Ok(CallToolResult::text(request.name)) })
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(tool("b"), echo(), vec![]).await.unwrap();
        registry.register(tool("a"), echo(), vec![]).await.unwrap();

        let names: Vec<_> = registry.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["a", "b"]);

        let (descriptor, chain) = registry.lookup("a").await.unwrap();
        assert_eq!(descriptor.name, "a");
        let result = chain
            .call(ToolExecutionContext::default(), CallToolRequest::new("a"))
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "a");

        let err = registry.lookup("missing").await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicates_rejected_until_unregistered() {
        let registry = ToolRegistry::new();
        registry.register(tool("a"), echo(), vec![]).await.unwrap();

        let err = registry.register(tool("a"), echo(), vec![]).await.unwrap_err();
        assert_eq!(err, McpError::DuplicateTool { name: "a".to_string() });

        registry.unregister("a").await.unwrap();
        assert!(!registry.contains("a").await);
        registry.register(tool("a"), echo(), vec![]).await.unwrap();
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister("zzz").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_schema_rejected() {
        let registry = ToolRegistry::new();
        let bad = Tool::new("bad", "", InputSchema::object().require("missing"));
        let err = registry.register(bad, echo(), vec![]).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidSchema { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_global_middleware_rebuilds_chains() {
        let registry = ToolRegistry::new();
        let per_tool = middleware_fn("per_tool", |c, r, next: Next| async move { next.run(c, r).await });
        registry.register(tool("a"), echo(), vec![per_tool]).await.unwrap();
        assert_eq!(registry.lookup("a").await.unwrap().1.depth(), 1);

        let (_, held) = registry.lookup("a").await.unwrap();
        registry
            .use_middleware(middleware_fn("global", |c, r, next: Next| async move { next.run(c, r).await }))
            .await;

        let (_, rebuilt) = registry.lookup("a").await.unwrap();
        assert_eq!(rebuilt.layers(), ["global", "per_tool"]);
        // Chains already handed out are unaffected
        assert_eq!(held.depth(), 1);
    }
}
