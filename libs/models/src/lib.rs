//! Shared data model for the corral orchestrator.
//!
//! These types cross the wire between the control plane, the node agent,
//! and API clients:
//!
//! - [`Container`]: the declarative container spec held by the control plane
//! - [`Node`]: a registered worker node
//! - [`ContainerStatus`] / [`DesiredStatus`]: observed vs declared state
//! - Request/patch types with validation
//!
//! The control plane owns every `Container` and `Node` record; the agent's
//! view is derivative and fetched per reconciliation tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A field-level validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid field '{field}': {message}")]
pub struct ValidationError {
    /// The offending field.
    pub field: &'static str,

    /// What was wrong with it.
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Observed status of a container, as reported by a node agent.
///
/// `Unknown` is a driver-error sentinel for a single observation. It is never
/// carried across ticks without re-observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Declared target state for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

impl Default for DesiredStatus {
    fn default() -> Self {
        DesiredStatus::Running
    }
}

impl std::fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredStatus::Running => write!(f, "running"),
            DesiredStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl DesiredStatus {
    /// The observed status a converged container reports.
    pub fn as_observed(&self) -> ContainerStatus {
        match self {
            DesiredStatus::Running => ContainerStatus::Running,
            DesiredStatus::Stopped => ContainerStatus::Stopped,
        }
    }
}

/// Transport protocol for a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// The declarative container spec.
///
/// `id` is client-supplied and immutable after creation. `node_id` is
/// assigned exactly once by the control plane's scheduler and immutable
/// thereafter; it stays empty while the container is unscheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Cluster-wide unique identifier.
    pub id: String,

    /// Owning node, or empty until scheduled.
    #[serde(default)]
    pub node_id: String,

    /// Image reference to run.
    pub image: String,

    /// Environment, ordered `KEY=VAL` entries.
    #[serde(default)]
    pub env: Vec<String>,

    /// Published ports.
    #[serde(default)]
    pub ports: Vec<Port>,

    /// Storage quota in gigabytes.
    pub storage_limit_gb: u32,

    /// Grace period between SIGTERM and SIGKILL when stopping.
    pub stop_timeout_s: u32,

    /// Target state the agent converges toward.
    #[serde(default)]
    pub desired_status: DesiredStatus,

    /// Set by a delete request; the record is dropped once the owning agent
    /// confirms the container is absent from its runtime.
    #[serde(default)]
    pub marked_for_deletion: bool,
}

impl Container {
    /// Merge mutable fields from a patch. `id` and `node_id` are not
    /// representable in [`ContainerPatch`] and therefore cannot change.
    pub fn apply_patch(&mut self, patch: &ContainerPatch) {
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(env) = &patch.env {
            self.env = env.clone();
        }
        if let Some(ports) = &patch.ports {
            self.ports = ports.clone();
        }
        if let Some(desired_status) = patch.desired_status {
            self.desired_status = desired_status;
        }
        if let Some(stop_timeout_s) = patch.stop_timeout_s {
            self.stop_timeout_s = stop_timeout_s;
        }
        if let Some(storage_limit_gb) = patch.storage_limit_gb {
            self.storage_limit_gb = storage_limit_gb;
        }
    }
}

/// Validate an env entry: non-empty `KEY=VAL` with a non-empty key.
fn validate_env_entry(entry: &str) -> Result<(), ValidationError> {
    match entry.split_once('=') {
        Some((key, _)) if !key.is_empty() => Ok(()),
        _ => Err(ValidationError::new(
            "env",
            format!("entry '{entry}' is not KEY=VAL"),
        )),
    }
}

/// Request body for `POST /containers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub id: String,

    pub image: String,

    #[serde(default)]
    pub env: Vec<String>,

    /// Omitted ports fall back to the control plane's configured default.
    #[serde(default)]
    pub ports: Option<Vec<Port>>,

    /// Omitted quota falls back to the control plane's configured default.
    #[serde(default)]
    pub storage_limit_gb: Option<u32>,

    #[serde(default)]
    pub stop_timeout_s: Option<u32>,

    /// Defaults to `running` when unspecified.
    #[serde(default)]
    pub desired_status: Option<DesiredStatus>,
}

impl CreateContainerRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::new("id", "must not be empty"));
        }
        if self.image.is_empty() {
            return Err(ValidationError::new("image", "must not be empty"));
        }
        for entry in &self.env {
            validate_env_entry(entry)?;
        }
        Ok(())
    }
}

/// Partial update for `PATCH /containers/{id}`.
///
/// Only mutable fields are representable; a body carrying `id`, `node_id`,
/// or anything else unknown is rejected at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Port>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_status: Option<DesiredStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_s: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit_gb: Option<u32>,
}

impl ContainerPatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(image) = &self.image {
            if image.is_empty() {
                return Err(ValidationError::new("image", "must not be empty"));
            }
        }
        if let Some(env) = &self.env {
            for entry in env {
                validate_env_entry(entry)?;
            }
        }
        Ok(())
    }
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    /// Runtime isolation scope, one per node.
    pub namespace: String,

    /// Last time the node's agent contacted the control plane.
    pub last_seen: DateTime<Utc>,
}

/// Request body for `POST /nodes`. Registration is idempotent by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub id: String,
    pub namespace: String,
}

impl RegisterNodeRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::new("id", "must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(ValidationError::new("namespace", "must not be empty"));
        }
        Ok(())
    }
}

/// A node together with its desired container set.
///
/// This is the agent-facing view: `containers` is computed from
/// `Container.node_id`, never stored on the node record, and includes
/// marked-for-deletion containers so the agent can confirm their absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub id: String,
    pub namespace: String,
    pub last_seen: DateTime<Utc>,
    pub containers: Vec<Container>,
}

/// Status observation reported by an agent for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    pub status: ContainerStatus,
    pub observed_at: DateTime<Utc>,
}

/// Request body for the agent's per-container status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ContainerStatus,
    pub observed_at: DateTime<Utc>,
}

/// Cluster-level defaults applied when a create request omits a field.
///
/// The original deployment baked a fixed game port and a 2 GB quota into the
/// model; here they are configuration on the control plane.
#[derive(Debug, Clone)]
pub struct ContainerDefaults {
    /// Storage quota when the request omits `storage_limit_gb`.
    pub storage_limit_gb: u32,

    /// Stop grace period when the request omits `stop_timeout_s`.
    pub stop_timeout_s: u32,

    /// When set, requests that omit `ports` get this host=container TCP port.
    pub port: Option<u16>,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            storage_limit_gb: 2,
            stop_timeout_s: 10,
            port: None,
        }
    }
}

impl ContainerDefaults {
    /// Build a full container spec from a create request, filling defaults.
    /// `node_id` is left empty for the scheduler.
    pub fn materialize(&self, req: CreateContainerRequest) -> Container {
        let ports = match req.ports {
            Some(ports) => ports,
            None => self
                .port
                .map(|p| {
                    vec![Port {
                        host_port: p,
                        container_port: p,
                        protocol: Protocol::Tcp,
                    }]
                })
                .unwrap_or_default(),
        };

        Container {
            id: req.id,
            node_id: String::new(),
            image: req.image,
            env: req.env,
            ports,
            storage_limit_gb: req.storage_limit_gb.unwrap_or(self.storage_limit_gb),
            stop_timeout_s: req.stop_timeout_s.unwrap_or(self.stop_timeout_s),
            desired_status: req.desired_status.unwrap_or_default(),
            marked_for_deletion: false,
        }
    }
}
