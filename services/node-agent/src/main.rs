//! corral Node Agent
//!
//! Runs on each worker host and converges the local container runtime
//! toward the desired state held by the control plane.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corral_node_agent::config::Config;
use corral_node_agent::reconciler::Reconciler;
use corral_node_agent::runtime::MockRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral node agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        node_id = %config.node_id,
        control_node_uri = %config.control_node_uri,
        runtime_namespace = %config.runtime_namespace,
        runtime_socket = %config.runtime_socket,
        "Configuration loaded"
    );

    // The mock runtime stands in until a real driver (speaking
    // `runtime_socket`) is plugged into the ContainerRuntime seam.
    warn!("No runtime driver configured, using the in-memory mock runtime");
    let runtime = Arc::new(MockRuntime::new());

    let reconciler = Reconciler::new(&config, runtime)?;

    // Stop accepting new ticks on ctrl-c; in-flight operations are bounded
    // by their own deadlines.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    reconciler.run(shutdown_rx).await;

    info!("Node agent stopped");
    Ok(())
}
