use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub control_node_uri: String,
    pub node_id: String,
    pub runtime_namespace: String,
    pub runtime_socket: String,
    pub poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let control_node_uri = std::env::var("CORRAL_CONTROL_NODE_URI")
            .unwrap_or_else(|_| "http://127.0.0.1:3001".to_string());

        let node_id = std::env::var("CORRAL_NODE_ID").unwrap_or_else(|_| "node-0".to_string());

        let runtime_namespace =
            std::env::var("CORRAL_RUNTIME_NAMESPACE").unwrap_or_else(|_| "corral".to_string());

        let runtime_socket = std::env::var("CORRAL_RUNTIME_SOCKET")
            .unwrap_or_else(|_| "/run/containerd/containerd.sock".to_string());

        let poll_interval_s = std::env::var("CORRAL_POLL_INTERVAL_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            control_node_uri,
            node_id,
            runtime_namespace,
            runtime_socket,
            poll_interval: Duration::from_secs(poll_interval_s),
        })
    }
}
