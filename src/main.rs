use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use beatscope::config;
use beatscope::server;
use beatscope::DownbeatTracker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Availability is decided once here; requests only ever see the
    // capability interface.
    let tracker = Arc::new(DownbeatTracker::load(&config::downbeat_model_path()));

    server::start_server(config::listen_port(), tracker)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
