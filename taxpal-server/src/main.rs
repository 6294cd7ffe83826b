mod api;
mod config;
mod error;
mod llm;
mod rate_limit;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use api::AppState;
use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let config = ServerConfig::from_env()?;
    if config.api_key_configured() {
        info!("OpenAI API key configured");
    } else {
        warn!("OPENAI_API_KEY is not set; /api/chat will answer API_KEY_MISSING");
    }
    match &config.static_dir {
        Some(dir) if dir.is_dir() => info!(dir = %dir.display(), "Serving front-end build"),
        Some(dir) => warn!(dir = %dir.display(), "Static directory not found"),
        None => {}
    }
    info!(
        model = %config.upstream.model,
        max_tokens = config.rate_limit.max_tokens,
        refill_per_sec = config.rate_limit.refill_per_sec,
        origins = ?config.allowed_origins,
        "Gateway configured"
    );

    let addr = config.socket_addr();
    let state = Arc::new(AppState::new(config)?);
    let app = api::router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taxpal_server=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).compact())
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
