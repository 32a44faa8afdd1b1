//! Lobby Server
//!
//! Usage: `lobby-server [config.json]`. Without a path the configuration is
//! read from `LOBBY_*` environment variables.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lobby_core::{LobbyServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => ServerConfig::from_env().context("loading config from environment")?,
    };

    info!("Lobby Server v{}", VERSION);
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Send queue: {} messages, send tick: {} ms",
        config.send_queue_capacity, config.send_tick_ms
    );

    let server = LobbyServer::new(config);

    // The accept loop exits on its own once the shutdown signal is sent.
    let shutdown_on_ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_on_ctrl_c => {}
    }

    info!("Lobby server stopped");
    Ok(())
}
