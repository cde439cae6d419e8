//! Stateful Scenes Server
//!
//! Main entry point. Usage: `stateful-scenes [CONFIG_DIR]`.

use anyhow::Result;
use scene_server::StatefulScenes;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    info!(config_dir = %config_dir.display(), "Starting stateful scenes");

    let app = StatefulScenes::new(config_dir);
    let count = app.load().await?;
    info!(scenes = count, "Stateful scenes is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    app.shutdown().await;

    Ok(())
}
