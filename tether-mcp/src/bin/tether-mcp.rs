//! `tether-mcp` command line: serve the demo tools over any transport

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tether_logging::init_logging_from_config;
use tether_mcp::middleware::{ArgumentTokenAuth, PanicRecovery, RateLimit, RequestLogging, ToolMetrics};
use tether_mcp::server::{sse_routes, streamable_http_routes, HttpMode};
use tether_mcp::{demo, McpConfig, McpServer};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Raise the log level once per occurrence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo tools
    Serve {
        #[arg(long, value_enum, default_value_t = ServeTransport::Stdio)]
        transport: ServeTransport,

        /// Issue Mcp-Session-Id sessions on the streamable HTTP endpoint
        #[arg(long)]
        stateful: bool,

        /// Host to bind to (HTTP transports)
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Port to bind to (HTTP transports)
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,

        /// Accepted `auth_token`; may be repeated
        #[arg(long = "token", value_name = "TOKEN")]
        tokens: Vec<String>,
    },

    /// Print the demo tool descriptors as JSON
    Tools,

    /// Load and validate the configuration file
    ValidateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServeTransport {
    Stdio,
    Sse,
    StreamableHttp,
}

fn load_config(path: Option<&PathBuf>) -> Result<McpConfig> {
    match path {
        Some(path) => McpConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(McpConfig::default()),
    }
}

async fn build_server(config: &McpConfig) -> Result<(McpServer, ToolMetrics)> {
    let server = McpServer::new(config.server.clone());
    let metrics = ToolMetrics::new();

    server.use_middleware(Arc::new(PanicRecovery::new())).await;
    server.use_middleware(Arc::new(RequestLogging::new())).await;
    if let Some(rate_limit) = &config.rate_limit {
        server
            .use_middleware(Arc::new(RateLimit::new(rate_limit.clone())))
            .await;
    }
    if config.auth.enabled {
        server
            .use_middleware(Arc::new(ArgumentTokenAuth::from_config(&config.auth)))
            .await;
    } else {
        warn!("Argument token auth disabled; demo tools accept any caller");
    }
    server.use_middleware(Arc::new(metrics.clone())).await;

    demo::register(&server)
        .await
        .context("Failed to register demo tools")?;
    Ok((server, metrics))
}

/// Ctrl-C shuts the server down; the returned task ends when it has
fn spawn_shutdown_on_ctrl_c(server: McpServer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = server.shutdown_token();
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received shutdown signal");
                server.shutdown().await;
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

async fn serve_http(server: McpServer, transport: ServeTransport) -> Result<()> {
    let http = server.config().http.clone();
    let routes = match transport {
        ServeTransport::Sse => sse_routes(server.clone()),
        _ => streamable_http_routes(server.clone()),
    };
    let app = axum::Router::new()
        .merge(routes)
        .layer(TraceLayer::new_for_http());

    let address = http.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!(
        address = %address,
        transport = ?transport,
        mode = ?http.mode,
        "MCP server listening"
    );

    let shutdown = server.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn serve(
    mut config: McpConfig,
    transport: ServeTransport,
    stateful: bool,
    host: Option<String>,
    port: Option<u16>,
    tokens: Vec<String>,
) -> Result<()> {
    if stateful {
        config.server.http.mode = HttpMode::Stateful;
    }
    if let Some(host) = host {
        config.server.http.host = host;
    }
    if let Some(port) = port {
        config.server.http.port = port;
    }
    if !tokens.is_empty() {
        config.auth.enabled = true;
        config.auth.tokens.extend(tokens);
    }
    config.validate()?;
    if transport == ServeTransport::StreamableHttp {
        config.validate_for_streamable_http()?;
    }

    let (server, metrics) = build_server(&config).await?;
    let signal_task = spawn_shutdown_on_ctrl_c(server.clone());

    let outcome = match transport {
        ServeTransport::Stdio => {
            info!("Serving MCP over stdio");
            server.run_stdio().await.map_err(anyhow::Error::from)
        }
        ServeTransport::Sse | ServeTransport::StreamableHttp => serve_http(server.clone(), transport).await,
    };

    server.shutdown().await;
    signal_task.abort();

    for (tool, stats) in metrics.snapshot().await {
        info!(
            tool = %tool,
            calls = stats.calls,
            successes = stats.successes,
            failures = stats.failures,
            average_ms = stats.average_duration().as_millis() as u64,
            "tool usage"
        );
    }
    info!("MCP server shutdown complete");
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let mut logging = config.logging.clone();
    logging.level = logging.level.raised_by(cli.verbose);
    init_logging_from_config(&logging)?;

    match cli.command {
        Commands::Serve {
            transport,
            stateful,
            host,
            port,
            tokens,
        } => serve(config, transport, stateful, host, port, tokens).await,
        Commands::Tools => {
            let tools = serde_json::to_string_pretty(&demo::tools())
                .context("Failed to format tool descriptors")?;
            println!("{}", tools);
            Ok(())
        }
        Commands::ValidateConfig => {
            let path = cli
                .config
                .context("validate-config requires --config <PATH>")?;
            // Already loaded and validated above
            println!("Configuration {} is valid", path.display());
            Ok(())
        }
    }
}
