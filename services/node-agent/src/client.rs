//! Control plane API client for the node agent.
//!
//! Provides methods for communicating with the control plane:
//! - Fetching this node's desired container set
//! - Joining the cluster when the node is not yet registered
//! - Reporting observed container status

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use corral_models::{ContainerStatus, NodeView, RegisterNodeRequest, StatusReport};
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::config::Config;

/// Deadline for the per-tick desired-set fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for registration and status reports.
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a desired-set fetch.
#[derive(Debug)]
pub enum NodeFetch {
    /// The node is registered; here is its desired set.
    View(NodeView),

    /// The control plane does not know this node yet; join first.
    NotRegistered,
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.control_node_uri.clone(),
            node_id: config.node_id.clone(),
        })
    }

    /// Fetch this node's record and desired container set.
    pub async fn fetch_node(&self) -> Result<NodeFetch> {
        let url = format!("{}/nodes/{}", self.base_url, self.node_id);
        debug!(url = %url, "Fetching desired container set");

        let response = self
            .client
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(NodeFetch::NotRegistered);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch desired set");
            anyhow::bail!("Failed to fetch desired set: {} - {}", status, body);
        }

        let view: NodeView = response.json().await?;
        debug!(
            container_count = view.containers.len(),
            "Fetched desired container set"
        );

        Ok(NodeFetch::View(view))
    }

    /// Register this node with the control plane. Idempotent.
    pub async fn register(&self, namespace: &str) -> Result<()> {
        let url = format!("{}/nodes", self.base_url);
        let request = RegisterNodeRequest {
            id: self.node_id.clone(),
            namespace: namespace.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(REPORT_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to join cluster: {}", response.status());
        }

        debug!(node_id = %self.node_id, namespace, "Joined cluster");
        Ok(())
    }

    /// Report the observed status of one container.
    pub async fn report_status(&self, container_id: &str, status: ContainerStatus) -> Result<()> {
        let url = format!(
            "{}/nodes/{}/containers/{}/status",
            self.base_url, self.node_id, container_id
        );
        let report = StatusReport {
            status,
            observed_at: Utc::now(),
        };

        let response = self
            .client
            .post(&url)
            .json(&report)
            .timeout(REPORT_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to report status: {}", response.status());
        }

        Ok(())
    }
}
