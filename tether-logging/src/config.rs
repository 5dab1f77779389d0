//! Logging configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::filter::Directive;

/// Errors raised while loading or validating a [`LoggingConfig`]
#[derive(Error, Debug)]
pub enum LoggingConfigError {
    #[error("Failed to read logging config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse logging config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid filter directive '{directive}': {message}")]
    InvalidDirective { directive: String, message: String },

    #[error("Unknown log level '{0}'")]
    UnknownLevel(String),
}

/// Minimum level emitted by the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Level reached after `verbosity` repeated `-v` flags on top of this one
    pub fn raised_by(self, verbosity: u8) -> Self {
        let ladder = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let start = ladder.iter().position(|level| *level == self).unwrap_or(2);
        let index = (start + verbosity as usize).min(ladder.len() - 1);
        ladder[index]
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LoggingConfigError::UnknownLevel(other.to_string())),
        }
    }
}

/// Line format of the fmt subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// Logging section of a Tether configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Colour output; turn off when stderr is captured to a file
    #[serde(default = "default_true")]
    pub ansi: bool,

    #[serde(default = "default_true")]
    pub with_target: bool,

    #[serde(default)]
    pub with_thread_ids: bool,

    /// Extra `EnvFilter` directives such as `hyper=warn`
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            ansi: true,
            with_target: true,
            with_thread_ids: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Load a standalone logging config from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoggingConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| LoggingConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Check that every extra directive parses
    pub fn validate(&self) -> Result<(), LoggingConfigError> {
        for directive in &self.directives {
            Directive::from_str(directive).map_err(|e| LoggingConfigError::InvalidDirective {
                directive: directive.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}
