use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::{net::SocketAddr, path::PathBuf};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use gatehouse::GatewayCore;
use gatehouse::config::{FileConfig, GatehouseConfig, GatewayConfig, load_config};
use gatehouse::hooks::Hooks;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Authentication and session gateway for browser terminals")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.gatehouse)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server in the foreground
    Server(ServerArgs),

    /// Generate an API key/secret pair for `auth.mode = "api"`
    NewApiKey,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Serialize)]
struct ApiKeySnippet {
    auth: ApiKeyTable,
}

#[derive(Serialize)]
struct ApiKeyTable {
    api_keys: BTreeMap<String, String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args, cli.data_dir).await,
        Commands::NewApiKey => new_api_key(),
    }
}

fn new_api_key() -> Result<()> {
    let (key, secret) = gatehouse_auth::generate_api_key();
    let snippet = ApiKeySnippet {
        auth: ApiKeyTable {
            api_keys: BTreeMap::from([(key, secret)]),
        },
    };
    println!("# Add to config.toml:");
    print!("{}", toml::to_string(&snippet).context("Failed to render API key")?);
    Ok(())
}

async fn run_server(args: ServerArgs, data_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "gatehouse=debug,tower_http=debug,info"
    } else {
        "gatehouse=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Gatehouse");

    let dirs = GatehouseConfig::new(data_dir)?;
    let mut file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", dirs.config_toml_path().display()))?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    let config = GatewayConfig::from_file(&file_config, &dirs.data_dir)?;

    info!(
        "Authentication mode: {:?} ({} API keys)",
        config.auth.mode,
        config.auth.api_keys.len()
    );
    info!(
        "Session timeout: {:?}, sweep every {:?}",
        config.sessions.session_timeout, config.sessions.session_timeout_check_interval
    );
    info!("Broadcast file: {}", config.sessions.broadcast_file.display());

    let bind = (config.server.host.clone(), config.server.port);
    let core = GatewayCore::new(config, Hooks::new())?;

    let app = gatehouse::router(core.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind((bind.0.as_str(), bind.1))
        .await
        .with_context(|| format!("Failed to bind {}:{}", bind.0, bind.1))?;
    let actual_addr = listener.local_addr()?;

    info!("Gatehouse listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET /ws           - WebSocket gateway");
    info!("  GET /health       - Health status");
    info!("  GET /metrics      - Server metrics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    // Give extensions a chance to clean up what they spawned per session
    core.shutdown();

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_snippet_is_valid_toml() {
        let snippet = ApiKeySnippet {
            auth: ApiKeyTable {
                api_keys: BTreeMap::from([("K1".to_string(), "S1".to_string())]),
            },
        };
        let rendered = toml::to_string(&snippet).unwrap();
        assert!(rendered.contains("[auth.api_keys]"));

        let parsed: FileConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.auth.api_keys.get("K1").map(String::as_str), Some("S1"));
    }

    #[test]
    fn cli_parses_server_overrides() {
        let cli = Cli::parse_from(["gatehouse", "server", "--port", "9000", "-b", "0.0.0.0", "--debug"]);
        let Commands::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert!(args.debug);
    }
}
