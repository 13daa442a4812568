use clap::Parser;
use openai_relay::{build_router, AppState, GatewayConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "openai-relay",
    about = "OpenAI-compatible gateway with model mapping and backend fallback",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long, env = "RELAY_HOST")]
    host: Option<String>,

    /// Replace the URL of the highest-priority backend
    #[arg(long, env = "RELAY_BACKEND_URL")]
    backend_url: Option<String>,

    /// Log filter, e.g. "debug" or "openai_relay=trace". RUST_LOG wins if set.
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// JSONL audit log path (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| match cli.log_level.as_deref() {
            Some(level) => tracing_subscriber::EnvFilter::try_new(level),
            None => tracing_subscriber::EnvFilter::try_new("openai_relay=info,tower_http=info"),
        })
        .unwrap_or_else(|_| "openai_relay=info,tower_http=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        println!("  1. openai-relay.toml (current directory)");
        if cfg!(target_os = "macos") {
            println!("  2. ~/Library/Application Support/openai-relay/config.toml");
        } else {
            println!("  2. $XDG_CONFIG_HOME/openai-relay/config.toml");
            println!("     ~/.config/openai-relay/config.toml");
        }
        println!("  3. ~/.openai-relay.toml");
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(ref url) = cli.backend_url {
        config.override_primary_backend_url(url);
    }
    if let Some(ref path) = cli.log_file {
        config.logging.file = Some(path.clone());
    }

    config.validate()?;

    let logger = match &config.logging.file {
        Some(path) => SharedLogger::new(path)?,
        None => SharedLogger::in_memory(),
    };

    info!("openai-relay v{}", env!("CARGO_PKG_VERSION"));
    for backend in config.backends.iter().filter(|b| b.enabled) {
        info!(
            "  Backend:   {} -> {} (timeout {}s)",
            backend.name,
            backend.url,
            config.backend_timeout(backend).as_secs()
        );
    }
    info!("  Models:    {} mapped", config.model_mapping.len());
    info!("  Default:   {}", config.default_model);
    info!(
        "  Auth:      {}",
        if config.authentication.enabled { "enabled" } else { "disabled" }
    );
    if let Some(path) = &config.logging.file {
        info!("  Log file:  {}", path.display());
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    logger.info(
        "startup",
        format!(
            "Starting openai-relay on {} with {} backend(s)",
            bind_addr,
            config.backends.iter().filter(|b| b.enabled).count()
        ),
    );

    let state = Arc::new(AppState::from_config(config, client, logger.clone())?);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    logger.info("shutdown", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
