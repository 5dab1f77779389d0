//! File-level configuration document

use serde::{Deserialize, Serialize};
use std::path::Path;
use tether_logging::LoggingConfig;

use crate::middleware::auth::AuthConfig;
use crate::middleware::{RateLimitConfig, RateLimitKey};
use crate::server::{HttpMode, McpServerConfig};
use crate::transport::TransportType;
use crate::{McpError, McpResult};

/// Everything a `tether-mcp` YAML file can hold
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Upstream server to connect to when acting as a client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportType>,

    #[serde(default)]
    pub server: McpServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Global rate limit; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl McpConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::Configuration {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config = Self::from_yaml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> McpResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| McpError::Configuration {
            message: format!("invalid configuration: {}", e),
        })
    }

    pub fn validate(&self) -> McpResult<()> {
        if let Some(transport) = &self.transport {
            transport.validate()?;
        }
        self.server.validate()?;
        self.logging.validate().map_err(|e| McpError::Configuration {
            message: e.to_string(),
        })?;
        self.auth.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Extra checks when serving streamable HTTP with this document
    pub fn validate_for_streamable_http(&self) -> McpResult<()> {
        let per_session = self
            .rate_limit
            .as_ref()
            .is_some_and(|limit| limit.key == RateLimitKey::PerSession);
        if per_session && self.server.http.mode == HttpMode::Stateless {
            return Err(McpError::Configuration {
                message: "per_session rate limits need stateful streamable HTTP; \
                          stateless mode opens a new session for every POST"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tether_logging::LogLevel;

    #[test]
    fn test_empty_document_is_valid() {
        let config = McpConfig::from_yaml("{}").unwrap();
        assert_eq!(config, McpConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
transport:
  type: streamable_http
  url: http://127.0.0.1:9000/mcp
server:
  name: demo
  http:
    mode: stateful
    idle_timeout: 5m
logging:
  level: debug
  format: json
auth:
  enabled: true
  tokens: [secret]
rate_limit:
  max_requests: 10
  window: 1s
"#
        )
        .unwrap();

        let config = McpConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.name, "demo");
        assert_eq!(config.server.http.mode, HttpMode::Stateful);
        assert_eq!(config.server.http.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.auth.enabled);
        assert_eq!(config.rate_limit.unwrap().max_requests, 10);
        assert_eq!(config.transport.unwrap().type_name(), "streamable_http");
    }

    #[test]
    fn test_validation_errors_surface() {
        let config = McpConfig::from_yaml("auth:\n  enabled: true\n").unwrap();
        assert!(matches!(config.validate(), Err(McpError::Configuration { .. })));

        let config = McpConfig::from_yaml("transport:\n  type: sse\n  url: ftp://nope\n").unwrap();
        assert!(config.validate().is_err());

        assert!(McpConfig::from_yaml("server: [").is_err());
    }

    #[test]
    fn test_per_session_limit_needs_stateful_http() {
        let raw = "rate_limit:\n  max_requests: 5\n  window: 1s\n  key: per_session\n";
        let config = McpConfig::from_yaml(raw).unwrap();
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.validate_for_streamable_http(),
            Err(McpError::Configuration { .. })
        ));

        let stateful = format!("{}server:\n  http:\n    mode: stateful\n", raw);
        let config = McpConfig::from_yaml(&stateful).unwrap();
        assert!(config.validate_for_streamable_http().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = McpConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, McpError::Configuration { .. }));
    }
}
