//! Logging setup for Tether
//!
//! Every binary in the workspace installs exactly one `tracing` subscriber
//! through this crate. Output always goes to stderr so that stdio transports
//! keep stdout reserved for protocol frames.

pub mod config;
pub mod init;

pub use config::{LogFormat, LogLevel, LoggingConfig, LoggingConfigError};
pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
