//! Windowed call limits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Next, ToolExecutionContext, ToolMiddleware};
use crate::protocol::{CallToolRequest, CallToolResult};
use crate::{McpError, McpResult};

/// Smallest retry hint handed to callers
const MIN_RETRY_AFTER: Duration = Duration::from_millis(10);

/// What a limit is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    #[default]
    PerTool,
    /// Not meaningful for stateless streamable HTTP, where every POST is a new session
    PerSession,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window
    pub max_requests: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Sliding window when true, fixed window otherwise
    #[serde(default = "default_sliding")]
    pub sliding_window: bool,

    #[serde(default)]
    pub key: RateLimitKey,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            sliding_window: true,
            key: RateLimitKey::default(),
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn fixed(mut self) -> Self {
        self.sliding_window = false;
        self
    }

    pub fn keyed_by(mut self, key: RateLimitKey) -> Self {
        self.key = key;
        self
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.max_requests == 0 {
            return Err(McpError::Configuration {
                message: "rate limit max_requests must be greater than 0".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(McpError::Configuration {
                message: "rate limit window must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_sliding() -> bool {
    true
}

#[derive(Debug)]
enum Window {
    Sliding(VecDeque<Instant>),
    Fixed { started: Instant, count: u32 },
}

impl Window {
    fn is_active(&self, now: Instant, window_length: Duration) -> bool {
        match self {
            Window::Sliding(calls) => calls
                .back()
                .is_some_and(|latest| now.duration_since(*latest) < window_length),
            Window::Fixed { started, .. } => now.duration_since(*started) < window_length,
        }
    }
}

#[derive(Debug)]
struct WindowTable {
    windows: HashMap<String, Window>,
    last_pruned: Instant,
}

/// Per-key window counters
///
/// Keys idle for a whole window are dropped, at most once per window, by
/// `check` itself.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    table: Mutex<WindowTable>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            table: Mutex::new(WindowTable {
                windows: HashMap::new(),
                last_pruned: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one call against `key`, or say how long to wait
    pub async fn check(&self, key: &str) -> McpResult<()> {
        let now = Instant::now();
        let window_length = self.config.window;
        let max = self.config.max_requests;

        let mut table = self.table.lock().await;
        if now.duration_since(table.last_pruned) >= window_length {
            table.windows.retain(|_, window| window.is_active(now, window_length));
            table.last_pruned = now;
        }
        let window = table.windows.entry(key.to_string()).or_insert_with(|| {
            if self.config.sliding_window {
                Window::Sliding(VecDeque::new())
            } else {
                Window::Fixed {
                    started: now,
                    count: 0,
                }
            }
        });

        let retry_after = match window {
            Window::Sliding(calls) => {
                while calls
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) >= window_length)
                {
                    calls.pop_front();
                }
                if calls.len() < max as usize {
                    calls.push_back(now);
                    None
                } else {
                    calls
                        .front()
                        .map(|oldest| window_length.saturating_sub(now.duration_since(*oldest)))
                }
            }
            Window::Fixed { started, count } => {
                if now.duration_since(*started) >= window_length {
                    *started = now;
                    *count = 0;
                }
                if *count < max {
                    *count += 1;
                    None
                } else {
                    Some(window_length.saturating_sub(now.duration_since(*started)))
                }
            }
        };

        match retry_after {
            None => Ok(()),
            Some(retry_after) => Err(McpError::RateLimitExceeded {
                message: format!("more than {} calls per {:?} for '{}'", max, window_length, key),
                retry_after: Some(retry_after.max(MIN_RETRY_AFTER)),
            }),
        }
    }

    /// Calls left in the current window for `key`
    pub async fn remaining(&self, key: &str) -> u32 {
        let now = Instant::now();
        let table = self.table.lock().await;
        let used = match table.windows.get(key) {
            None => 0,
            Some(Window::Sliding(calls)) => calls
                .iter()
                .filter(|at| now.duration_since(**at) < self.config.window)
                .count() as u32,
            Some(Window::Fixed { started, count }) => {
                if now.duration_since(*started) >= self.config.window {
                    0
                } else {
                    *count
                }
            }
        };
        self.config.max_requests.saturating_sub(used)
    }

    /// Forget keys with no calls in the current window
    pub async fn prune(&self) {
        let now = Instant::now();
        let window_length = self.config.window;
        let mut table = self.table.lock().await;
        table.windows.retain(|_, window| window.is_active(now, window_length));
        table.last_pruned = now;
    }

    /// Keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.table.lock().await.windows.len()
    }
}

/// Short-circuits calls over the limit with `McpError::RateLimitExceeded`
#[derive(Debug)]
pub struct RateLimit {
    limiter: RateLimiter,
}

impl RateLimit {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn key_for(&self, context: &ToolExecutionContext, request: &CallToolRequest) -> String {
        match self.limiter.config().key {
            RateLimitKey::PerTool => format!("tool:{}", request.name),
            RateLimitKey::PerSession => format!("session:{}", context.session_id),
            RateLimitKey::Global => "global".to_string(),
        }
    }
}

#[async_trait]
impl ToolMiddleware for RateLimit {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(
        &self,
        context: ToolExecutionContext,
        request: CallToolRequest,
        next: Next,
    ) -> McpResult<CallToolResult> {
        let key = self.key_for(&context, &request);
        if let Err(e) = self.limiter.check(&key).await {
            debug!(tool = %request.name, key = %key, "rate limit hit");
            return Err(e);
        }
        next.run(context, request).await
    }
}
