#![forbid(unsafe_code)]

use anyhow::Result;
use sfu_signaling::config::ServerConfig;
use sfu_signaling::media::mediasoup::{MediaConfig, MediasoupEngine};
use sfu_signaling::metrics::ServerMetrics;
use sfu_signaling::room::RoomManager;
use sfu_signaling::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_signaling=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SFU signaling - starting server");

    let config = ServerConfig::from_env()?;
    match config.announce_ip {
        Some(ip) => info!("Announcing {} in ICE candidates", ip),
        None => info!("No ANNOUNCE_IP set, ICE candidates carry the bound address"),
    }

    let media_config = MediaConfig::default().with_announced_ip(config.announce_ip);
    let engine = MediasoupEngine::new(media_config).await?;

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(Arc::new(engine), metrics));
    info!("Room manager and media engine initialized");

    let signaling_server = SignalingServer::new(room_manager.clone(), &config);

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    room_manager.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
