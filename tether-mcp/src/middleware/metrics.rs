//! Per-tool call counters

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::McpResult;

/// Counters for one tool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    /// Errors and `isError` results
    pub failures: u64,
    pub total_duration: Duration,
    pub last_called: Option<DateTime<Utc>>,
}

impl ToolStats {
    pub fn average_duration(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(calls) if calls > 0 => self.total_duration / calls,
            _ => Duration::ZERO,
        }
    }
}

/// Counts calls, successes, failures and time spent per tool.
///
/// Clones share the same counters, so one instance can sit in the chain while
/// another is kept for reporting.
#[derive(Debug, Clone, Default)]
pub struct ToolMetrics {
    stats: Arc<RwLock<HashMap<String, ToolStats>>>,
}

impl ToolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, ToolStats> {
        self.stats.read().await.clone()
    }

    pub async fn stats(&self, tool: &str) -> Option<ToolStats> {
        self.stats.read().await.get(tool).cloned()
    }

    async fn record(&self, tool: &str, succeeded: bool, elapsed: Duration) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(tool.to_string()).or_default();
        entry.calls += 1;
        if succeeded {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_duration += elapsed;
        entry.last_called = Some(Utc::now());
    }
}

#[async_trait]
impl ToolMiddleware for ToolMetrics {
    fn name(&self) -> &str {
        "tool_metrics"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        let tool = request.name.clone();
        let started = Instant::now();
        let outcome = next.run(context, request).await;

        let succeeded = matches!(&outcome, Ok(result) if !result.is_error);
        self.record(&tool, succeeded, started.elapsed()).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, Chain};
    use crate::McpError;

    #[tokio::test]
    async fn test_counts_per_tool() {
        let metrics = ToolMetrics::new();
        let handler = handler_fn(|_, request: CallToolRequest| async move {
            match request.name.as_str() {
                "good" => Ok(CallToolResult::text("ok")),
                "soft" => Ok(CallToolResult::error_text("bad input")),
                _ => Err(McpError::Internal {
                    message: "broken".to_string(),
                }),
            }
        });
        let chain = Chain::build(&[Arc::new(metrics.clone())], &[], handler);

        for name in ["good", "good", "soft", "hard"] {
            let _ = chain
                .call(ToolExecutionContext::default(), CallToolRequest::new(name))
                .await;
        }

        let good = metrics.stats("good").await.unwrap();
        assert_eq!((good.calls, good.successes, good.failures), (2, 2, 0));
        assert!(good.last_called.is_some());

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot["soft"].failures, 1);
        assert_eq!(snapshot["hard"].failures, 1);
        assert!(metrics.stats("never").await.is_none());
    }

    #[test]
    fn test_average_duration() {
        let stats = ToolStats {
            calls: 4,
            total_duration: Duration::from_millis(100),
            ..ToolStats::default()
        };
        assert_eq!(stats.average_duration(), Duration::from_millis(25));
        assert_eq!(ToolStats::default().average_duration(), Duration::ZERO);
    }
}
