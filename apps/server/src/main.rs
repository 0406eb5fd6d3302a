use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use mailhaven_server::{app, janitor, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config)?);

    janitor::spawn_tombstone_janitor(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("mailhaven sync service listening on {}", bind_addr);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
