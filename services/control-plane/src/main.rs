//! corral Control Plane
//!
//! Central coordination service: accepts container declarations, assigns
//! them to worker nodes, and streams observed status back to subscribers.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corral_control_plane::{api, config::Config, state::AppState, store::StateManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral control plane");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        node_expiry_secs = config.node_expiry.as_secs(),
        "Configuration loaded"
    );

    // Create application state around the single-writer state manager
    let manager = StateManager::new(config.defaults.clone(), config.node_expiry);
    let state = AppState::new(manager);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app).await?;

    Ok(())
}
