//! Token check on a tool argument

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::{McpError, McpResult};

/// Argument-token authentication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Argument that carries the token
    #[serde(default = "default_field")]
    pub field: String,

    /// Accepted tokens
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            field: default_field(),
            tokens: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> McpResult<()> {
        if self.enabled && self.tokens.is_empty() {
            return Err(McpError::Configuration {
                message: "auth is enabled but no tokens are configured".to_string(),
            });
        }
        if self.field.trim().is_empty() {
            return Err(McpError::Configuration {
                message: "auth field cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn default_field() -> String {
    "auth_token".to_string()
}

/// Requires `auth_token` (or the configured field) to hold an accepted token.
///
/// The token is stripped from the arguments before the call continues, so
/// handlers never see it. A missing or unknown token short-circuits with
/// `McpError::Unauthorized`.
#[derive(Debug, Clone)]
pub struct ArgumentTokenAuth {
    field: String,
    tokens: HashSet<String>,
}

impl ArgumentTokenAuth {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: default_field(),
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.iter().cloned()).with_field(config.field.clone())
    }
}

#[async_trait]
impl ToolMiddleware for ArgumentTokenAuth {
    fn name(&self) -> &str {
        "argument_token_auth"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        mut request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        match request.arguments.remove(&self.field) {
            Some(Value::String(token)) if self.tokens.contains(&token) => {
                next.run(context, request).await
            }
            presented => {
                debug!(
                    tool = %request.name,
                    session_id = %context.session_id,
                    token_present = presented.is_some(),
                    "rejecting call without a valid token"
                );
                Err(McpError::Unauthorized {
                    message: format!("missing or invalid '{}' argument", self.field),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, Chain};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn guarded(calls: Arc<AtomicUsize>) -> Chain {
        let handler = handler_fn(move |_, request: CallToolRequest| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                assert!(request.argument("auth_token").is_none());
                Ok(CallToolResult::text("ok"))
            }
        });
        Chain::build(&[Arc::new(ArgumentTokenAuth::new(["secret"]))], &[], handler)
    }

    #[tokio::test]
    async fn test_valid_token_is_stripped_and_passed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = CallToolRequest::new("hello").with_argument("auth_token", json!("secret"));

        let result = guarded(calls.clone())
            .call(ToolExecutionContext::default(), request)
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = guarded(calls.clone());

        for request in [
            CallToolRequest::new("hello"),
            CallToolRequest::new("hello").with_argument("auth_token", json!("wrong")),
            CallToolRequest::new("hello").with_argument("auth_token", json!(42)),
        ] {
            let err = chain.call(ToolExecutionContext::default(), request).await.unwrap_err();
            assert!(matches!(err, McpError::Unauthorized { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(AuthConfig::default().validate().is_ok());
        let enabled = AuthConfig {
            enabled: true,
            ..AuthConfig::default()
        };
        assert!(enabled.validate().is_err());
    }
}
