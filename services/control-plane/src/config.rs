//! Configuration for the control plane.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use corral_models::ContainerDefaults;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// How long a node may go unseen before it is considered stale.
    pub node_expiry: Duration,

    /// Defaults applied when a create request omits a field.
    pub defaults: ContainerDefaults,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CORRAL_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3001".to_string())
            .parse()?;

        let node_expiry_s = std::env::var("CORRAL_NODE_EXPIRY_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let storage_limit_gb = std::env::var("CORRAL_DEFAULT_STORAGE_GB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let port = std::env::var("CORRAL_DEFAULT_PORT")
            .ok()
            .and_then(|s| s.parse().ok());

        Ok(Self {
            listen_addr,
            node_expiry: Duration::from_secs(node_expiry_s),
            defaults: ContainerDefaults {
                storage_limit_gb,
                port,
                ..ContainerDefaults::default()
            },
        })
    }
}
