use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod handler;
mod proxy;
mod quota;
mod trace;
mod watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "loom_gateway=info,loom_pattern=info,loom_store=info,tower_http=warn".into()
            }),
        )
        .init();

    // load config: explicit path via LOOM_CONFIG > ./loom.toml > defaults
    let config_path = std::env::var("LOOM_CONFIG").ok();
    let config = loom_core::config::LoomConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        loom_core::config::LoomConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    // The soul is the one thing we refuse to start without.
    let state = Arc::new(app::AppState::init(config).await?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("The Loom is listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
