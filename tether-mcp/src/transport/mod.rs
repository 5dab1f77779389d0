//! Transport layer abstractions for MCP communication
//!
//! Every transport moves whole envelopes in both directions and hides its
//! own framing. A session drives a transport through exactly four
//! operations: [`McpTransport::start`], [`McpTransport::send`],
//! [`McpTransport::incoming`] and [`McpTransport::close`].

pub mod memory;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use memory::MemoryTransport;
pub use sse::{SseClientTransport, SseEvent, SseEventParser, SseServerTransport};
pub use stdio::StdioTransport;
pub use streamable_http::{
    HttpSessionManager, StatefulHttpTransport, StatelessHttpTransport,
    StreamableHttpClientTransport, MCP_SESSION_ID_HEADER,
};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{DecodeError, JsonRpcMessage};
use crate::{McpError, McpResult};

/// One inbound item: a decoded envelope or the reason a frame was rejected
pub type InboundItem = Result<JsonRpcMessage, DecodeError>;

/// Stream of inbound items; ends when the peer or the transport closes
pub type InboundStream = BoxStream<'static, InboundItem>;

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the underlying channel. Starting twice is a no-op.
    async fn start(&self) -> McpResult<()>;

    /// Write one envelope. Fails with `ConnectionClosed` after `close`.
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    /// Take the inbound stream. Only the first call succeeds.
    async fn incoming(&self) -> McpResult<InboundStream>;

    /// Release the channel. Redundant calls are no-ops.
    async fn close(&self) -> McpResult<()>;
}

/// Queue and framing limits shared by all transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Capacity of every inbound and outbound queue
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a send may wait for queue space
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout: default_send_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl TransportOptions {
    pub fn validate(&self) -> McpResult<()> {
        if self.channel_capacity == 0 {
            return Err(McpError::Configuration {
                message: "channel_capacity must be greater than 0".to_string(),
            });
        }
        if self.send_timeout.is_zero() {
            return Err(McpError::Configuration {
                message: "send_timeout must be greater than 0".to_string(),
            });
        }
        if self.max_message_size < 64 {
            return Err(McpError::Configuration {
                message: "max_message_size must be at least 64 bytes".to_string(),
            });
        }
        Ok(())
    }
}

/// Client-side transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportType {
    /// Spawn a local process and talk over its stdin/stdout
    #[serde(rename = "stdio")]
    Stdio {
        /// Command to execute
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,

        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// GET event stream plus POST message endpoint
    #[serde(rename = "sse")]
    Sse {
        /// Base URL; the event stream lives at `{url}/sse`
        url: String,

        /// HTTP headers to include
        #[serde(default)]
        headers: HashMap<String, String>,

        /// Authentication configuration
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<HttpAuth>,

        /// Connection timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },

    /// Single MCP endpoint, stateless or stateful
    #[serde(rename = "streamable_http")]
    StreamableHttp {
        /// Full URL of the MCP endpoint
        url: String,

        /// HTTP headers to include
        #[serde(default)]
        headers: HashMap<String, String>,

        /// Authentication configuration
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<HttpAuth>,

        /// Request timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,

        /// Open the GET push stream once the server issues a session id
        #[serde(default = "default_true")]
        push_stream: bool,
    },
}

/// HTTP authentication for client transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HttpAuth {
    #[serde(rename = "bearer")]
    Bearer { token: String },

    #[serde(rename = "basic")]
    Basic { username: String, password: String },

    #[serde(rename = "api_key")]
    ApiKey { header: String, key: String },
}

/// Headers and credentials attached to every client request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpClientSettings {
    pub headers: HashMap<String, String>,
    pub auth: Option<HttpAuth>,
    pub timeout: Option<Duration>,
}

impl HttpClientSettings {
    /// Apply headers and authentication to a request builder
    pub(crate) fn apply(&self, mut builder: RequestBuilder) -> RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        match &self.auth {
            Some(HttpAuth::Bearer { token }) => builder.bearer_auth(token),
            Some(HttpAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(HttpAuth::ApiKey { header, key }) => builder.header(header, key),
            None => builder,
        }
    }

    /// Per-request timeout for POST and DELETE exchanges
    pub(crate) fn request_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(default_timeout)
    }

    /// Client without an overall timeout: push streams stay open indefinitely
    pub(crate) fn build_client(&self) -> McpResult<Client> {
        let mut builder = Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder.build().map_err(|e| McpError::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
        })
    }
}

/// Parse and check an http(s) endpoint
pub(crate) fn parse_http_url(url: &str) -> McpResult<url::Url> {
    if url.trim().is_empty() {
        return Err(McpError::Configuration {
            message: "URL cannot be empty".to_string(),
        });
    }

    let parsed = url::Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(McpError::Configuration {
            message: format!(
                "Unsupported URL scheme: {}. Only http and https are allowed.",
                scheme
            ),
        }),
    }
}

/// Push into a bounded queue, waiting at most `send_timeout` for space
pub(crate) async fn send_bounded<T>(
    sender: &mpsc::Sender<T>,
    item: T,
    send_timeout: Duration,
) -> McpResult<()> {
    match tokio::time::timeout(send_timeout, sender.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(McpError::ConnectionClosed {
            reason: "peer queue dropped".to_string(),
        }),
        Err(_) => Err(McpError::Transport {
            message: format!("outbound queue full for {:?}", send_timeout),
        }),
    }
}

/// Wrap a receiver so the stream also ends when `closed` fires
pub(crate) fn inbound_stream(
    receiver: mpsc::Receiver<InboundItem>,
    closed: &CancellationToken,
) -> InboundStream {
    ReceiverStream::new(receiver)
        .take_until(closed.clone().cancelled_owned())
        .boxed()
}

/// Hand out a receiver parked in a slot, once
pub(crate) async fn take_receiver<T>(
    slot: &tokio::sync::Mutex<Option<mpsc::Receiver<T>>>,
) -> McpResult<mpsc::Receiver<T>> {
    slot.lock().await.take().ok_or_else(|| McpError::Transport {
        message: "inbound stream already taken".to_string(),
    })
}

/// Strip one trailing `\n` and an optional `\r` before it
pub(crate) fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

pub(crate) fn closed_error() -> McpError {
    McpError::ConnectionClosed {
        reason: "transport closed".to_string(),
    }
}

/// Transport factory for client connections
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport from configuration
    pub fn create(
        config: TransportType,
        options: TransportOptions,
    ) -> McpResult<Arc<dyn McpTransport>> {
        config.validate()?;
        match config {
            TransportType::Stdio {
                command,
                args,
                env,
                cwd,
            } => Ok(Arc::new(StdioTransport::spawn(command, args, env, cwd, options)?)),
            TransportType::Sse {
                url,
                headers,
                auth,
                timeout,
            } => {
                let settings = HttpClientSettings {
                    headers,
                    auth,
                    timeout: Some(timeout),
                };
                Ok(Arc::new(SseClientTransport::new(&url, settings, options)?))
            }
            TransportType::StreamableHttp {
                url,
                headers,
                auth,
                timeout,
                push_stream,
            } => {
                let settings = HttpClientSettings {
                    headers,
                    auth,
                    timeout: Some(timeout),
                };
                Ok(Arc::new(
                    StreamableHttpClientTransport::new(&url, settings, options)?
                        .with_push_stream(push_stream),
                ))
            }
        }
    }
}

/// Transport configuration validation
impl TransportType {
    /// Validate the transport configuration
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportType::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Configuration {
                        message: "Stdio transport command cannot be empty".to_string(),
                    });
                }
            }
            TransportType::Sse { url, .. } | TransportType::StreamableHttp { url, .. } => {
                parse_http_url(url).map_err(|e| McpError::Configuration {
                    message: format!("Invalid {} URL: {}", self.type_name(), e),
                })?;
            }
        }
        Ok(())
    }

    /// Get transport type name
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportType::Stdio { .. } => "stdio",
            TransportType::Sse { .. } => "sse",
            TransportType::StreamableHttp { .. } => "streamable_http",
        }
    }
}

// Helper functions for serde defaults
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    100
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_message_size() -> usize {
    4 * 1024 * 1024
}
