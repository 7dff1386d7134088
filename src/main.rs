//! Process entry point: loads configuration, initializes logging, and
//! serves the downstream WebSocket acceptor plus the health check route.

use std::sync::Arc;

use option_stream_proxy::config::AppConfig;
use option_stream_proxy::gateway::{self, state::AppState};
use option_stream_proxy::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let _log_guard = logging::init_logging(&config.logging);

    tracing::info!(git_hash = env!("GIT_HASH"), port = config.port, "starting");

    let port = config.port;
    let state = Arc::new(AppState::new(config));
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(%port, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
