//! MCP server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::MCP_PROTOCOL_VERSION;
use crate::session::SessionConfig;
use crate::transport::TransportOptions;
use crate::{McpError, McpResult};

/// MCP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name reported by `initialize`
    #[serde(default = "default_name")]
    pub name: String,

    /// Server version reported by `initialize`
    #[serde(default = "default_version")]
    pub version: String,

    /// Protocol revision offered when the client's is unsupported
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Deadline for one `tools/call`, middleware included
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub session: SessionConfig,

    /// Queue and frame limits for server-side transports
    #[serde(default)]
    pub transport: TransportOptions,

    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            protocol_version: default_protocol_version(),
            request_timeout: default_request_timeout(),
            session: SessionConfig::default(),
            transport: TransportOptions::default(),
            http: HttpConfig::default(),
        }
    }
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::Configuration {
                message: "server name cannot be empty".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(McpError::Configuration {
                message: "request_timeout must be greater than 0".to_string(),
            });
        }
        self.session.validate()?;
        self.transport.validate()?;
        self.http.validate()
    }
}

/// Streamable HTTP session handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMode {
    /// One exchange per POST, no session id, no push stream
    #[default]
    Stateless,
    /// `Mcp-Session-Id` sessions with a GET push stream
    Stateful,
}

/// HTTP listener settings for the SSE and streamable HTTP endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for `/sse`, `/message` and `/mcp`
    #[serde(default)]
    pub base_path: String,

    #[serde(default)]
    pub mode: HttpMode,

    /// Stateful sessions without traffic for this long are closed
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: String::new(),
            mode: HttpMode::default(),
            idle_timeout: default_idle_timeout(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `base_path` joined with `path`, normalized to one leading slash
    pub fn route(&self, path: &str) -> String {
        let base = self.base_path.trim_matches('/');
        if base.is_empty() {
            format!("/{}", path.trim_start_matches('/'))
        } else {
            format!("/{}/{}", base, path.trim_start_matches('/'))
        }
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.host.trim().is_empty() {
            return Err(McpError::Configuration {
                message: "http host cannot be empty".to_string(),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(McpError::Configuration {
                message: "http cleanup_interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_name() -> String {
    "tether-mcp".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_protocol_version() -> String {
    MCP_PROTOCOL_VERSION.to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = McpServerConfig::default();
        assert_eq!(config.name, "tether-mcp");
        assert_eq!(config.http.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.http.mode, HttpMode::Stateless);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: McpServerConfig = serde_yaml::from_str(
            r#"
name: demo
request_timeout: 2s
session:
  drain_timeout: 500ms
http:
  port: 3000
  mode: stateful
  base_path: /api/
"#,
        )
        .unwrap();

        assert_eq!(config.name, "demo");
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.session.drain_timeout, Duration::from_millis(500));
        assert_eq!(config.session.max_pending, SessionConfig::default().max_pending);
        assert_eq!(config.http.mode, HttpMode::Stateful);
        assert_eq!(config.http.route("mcp"), "/api/mcp");
    }

    #[test]
    fn test_routes_without_base() {
        let http = HttpConfig::default();
        assert_eq!(http.route("/sse"), "/sse");
        assert_eq!(http.route("message"), "/message");
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = McpServerConfig::default().with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
