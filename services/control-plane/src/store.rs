//! The state manager: single-writer store of desired and observed state.
//!
//! The state manager is the sole mutator of container and node records.
//! Every mutation runs under the write half of one coarse async lock, so any
//! externally observable sequence of operations is equivalent to some serial
//! order and no reader ever sees a partially applied patch. Status commits
//! and hub fan-out happen under the same guard, which makes commit +
//! notification atomic with respect to other writers; fan-out itself never
//! awaits (see [`crate::hub`]), so holding the guard across it is safe.
//!
//! Deletion is two-phase: a delete request marks the record, the owning
//! agent converges the runtime and keeps reporting, and a `stopped` report
//! for a marked container finalizes the removal. Containers that were never
//! scheduled have no owning agent and are removed immediately.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use corral_models::{
    Container, ContainerDefaults, ContainerPatch, ContainerStatus, CreateContainerRequest, Node,
    NodeView, ObservedStatus, RegisterNodeRequest, ValidationError,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::hub::{StatusSubscription, SubscriptionHub};
use crate::scheduler;

/// Errors surfaced by state manager operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A container with this id already exists.
    #[error("container '{0}' already exists")]
    Conflict(String),

    /// The addressed entity does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The request failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl StoreError {
    fn container_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    }

    fn node_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "node",
            id: id.to_string(),
        }
    }
}

/// A container together with its derived scheduling state.
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub container: Container,

    /// True when the container has no node or its node has gone stale.
    pub unscheduled: bool,
}

struct StoreInner {
    containers: BTreeMap<String, Container>,
    nodes: BTreeMap<String, Node>,
    observed: HashMap<String, ObservedStatus>,
}

impl StoreInner {
    fn unscheduled(&self, container: &Container, expiry: Duration) -> bool {
        if container.node_id.is_empty() {
            return true;
        }
        match self.nodes.get(&container.node_id) {
            Some(node) => !scheduler::is_fresh(node, Utc::now(), expiry),
            None => true,
        }
    }
}

/// Single-writer state manager guarding the in-memory store.
pub struct StateManager {
    inner: RwLock<StoreInner>,
    hub: SubscriptionHub,
    defaults: ContainerDefaults,
    node_expiry: Duration,
}

impl StateManager {
    pub fn new(defaults: ContainerDefaults, node_expiry: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                containers: BTreeMap::new(),
                nodes: BTreeMap::new(),
                observed: HashMap::new(),
            }),
            hub: SubscriptionHub::new(),
            defaults,
            node_expiry,
        }
    }

    /// Snapshot of all containers, sorted by id.
    pub async fn list_containers(&self) -> Vec<ContainerView> {
        let inner = self.inner.read().await;
        inner
            .containers
            .values()
            .map(|c| ContainerView {
                unscheduled: inner.unscheduled(c, self.node_expiry),
                container: c.clone(),
            })
            .collect()
    }

    pub async fn get_container(&self, id: &str) -> Result<ContainerView, StoreError> {
        let inner = self.inner.read().await;
        let container = inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::container_not_found(id))?;
        let unscheduled = inner.unscheduled(&container, self.node_expiry);
        Ok(ContainerView {
            container,
            unscheduled,
        })
    }

    /// Add a container, filling defaults and assigning a node.
    pub async fn add_container(
        &self,
        req: CreateContainerRequest,
    ) -> Result<Container, StoreError> {
        req.validate()?;

        let mut inner = self.inner.write().await;
        if inner.containers.contains_key(&req.id) {
            return Err(StoreError::Conflict(req.id));
        }

        let mut container = self.defaults.materialize(req);
        if let Some(node_id) = scheduler::pick_node(&inner.nodes, Utc::now(), self.node_expiry) {
            container.node_id = node_id;
        }

        info!(
            container_id = %container.id,
            node_id = %container.node_id,
            image = %container.image,
            "Container added"
        );
        inner
            .containers
            .insert(container.id.clone(), container.clone());
        Ok(container)
    }

    /// Merge mutable fields into an existing container.
    pub async fn patch_container(
        &self,
        id: &str,
        patch: ContainerPatch,
    ) -> Result<Container, StoreError> {
        patch.validate()?;

        let mut inner = self.inner.write().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| StoreError::container_not_found(id))?;

        container.apply_patch(&patch);
        debug!(container_id = %id, "Container patched");
        Ok(container.clone())
    }

    /// Mark a container for deletion. Idempotent for already-marked
    /// containers; never-scheduled containers are removed on the spot.
    pub async fn remove_container(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let (scheduled, already_marked) = {
            let container = inner
                .containers
                .get(id)
                .ok_or_else(|| StoreError::container_not_found(id))?;
            (!container.node_id.is_empty(), container.marked_for_deletion)
        };

        if !scheduled {
            inner.containers.remove(id);
            inner.observed.remove(id);
            self.hub.publish_gone(id);
            info!(container_id = %id, "Unscheduled container removed");
            return Ok(());
        }

        if !already_marked {
            if let Some(container) = inner.containers.get_mut(id) {
                container.marked_for_deletion = true;
            }
            info!(container_id = %id, "Container marked for deletion");
        }
        Ok(())
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().await;
        inner.nodes.values().cloned().collect()
    }

    pub async fn get_node(&self, id: &str) -> Result<Node, StoreError> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::node_not_found(id))
    }

    /// Register a node. Re-registering the same id refreshes its record.
    pub async fn register_node(&self, req: RegisterNodeRequest) -> Result<Node, StoreError> {
        req.validate()?;

        let mut inner = self.inner.write().await;
        let node = Node {
            id: req.id.clone(),
            namespace: req.namespace,
            last_seen: Utc::now(),
        };
        let previous = inner.nodes.insert(req.id.clone(), node.clone());
        if previous.is_none() {
            info!(node_id = %req.id, namespace = %node.namespace, "Node registered");
        }
        Ok(node)
    }

    /// The agent-facing view: the node plus its desired container set,
    /// including marked-for-deletion containers. Fetching it counts as a
    /// heartbeat and refreshes `last_seen`.
    pub async fn node_view(&self, id: &str) -> Result<NodeView, StoreError> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::node_not_found(id))?;
        node.last_seen = Utc::now();
        let node = node.clone();

        let containers = inner
            .containers
            .values()
            .filter(|c| c.node_id == id)
            .cloned()
            .collect();

        Ok(NodeView {
            id: node.id,
            namespace: node.namespace,
            last_seen: node.last_seen,
            containers,
        })
    }

    /// Commit an agent's observation for one container.
    ///
    /// Publishes to the hub only when the committed value differs from the
    /// cached one. A `stopped` observation for a marked-for-deletion
    /// container confirms absence and finalizes the removal.
    pub async fn report_status(
        &self,
        node_id: &str,
        container_id: &str,
        status: ContainerStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let (owner, marked_for_deletion) = match inner.containers.get(container_id) {
            Some(container) => (container.node_id.clone(), container.marked_for_deletion),
            None => {
                // The agent may still be converging a container we already
                // finalized; that report is stale, not an error.
                debug!(container_id, "Status report for unknown container ignored");
                return Ok(());
            }
        };

        if owner != node_id {
            warn!(
                container_id,
                reporter = node_id,
                owner = %owner,
                "Status report from non-owning node ignored"
            );
            return Ok(());
        }

        if marked_for_deletion && status == ContainerStatus::Stopped {
            inner.containers.remove(container_id);
            inner.observed.remove(container_id);
            self.hub.publish_gone(container_id);
            info!(container_id, "Deletion confirmed by agent, record removed");
            return Ok(());
        }

        let observed = ObservedStatus {
            status,
            observed_at: Utc::now(),
        };
        let changed = inner
            .observed
            .insert(container_id.to_string(), observed)
            .map(|prev| prev.status != status)
            .unwrap_or(true);

        if changed {
            debug!(container_id, status = %status, "Status change committed");
            self.hub.publish(container_id, status);
        }
        Ok(())
    }

    /// Last committed observation, if any.
    pub async fn observed_status(&self, container_id: &str) -> Option<ObservedStatus> {
        let inner = self.inner.read().await;
        inner.observed.get(container_id).copied()
    }

    /// Subscribe to status changes for a container. The latest committed
    /// value, when one exists, is delivered as an initial snapshot.
    pub async fn subscribe_status(
        &self,
        container_id: &str,
    ) -> Result<StatusSubscription, StoreError> {
        // Write guard: subscribing must serialize with commits so a caller
        // who observed a value via get cannot miss the next change.
        let inner = self.inner.write().await;
        if !inner.containers.contains_key(container_id) {
            return Err(StoreError::container_not_found(container_id));
        }
        let snapshot = inner.observed.get(container_id).map(|o| o.status);
        Ok(self.hub.subscribe(container_id, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::StatusEvent;
    use corral_models::DesiredStatus;

    fn manager() -> StateManager {
        StateManager::new(ContainerDefaults::default(), Duration::from_secs(15))
    }

    fn create_request(id: &str) -> CreateContainerRequest {
        CreateContainerRequest {
            id: id.to_string(),
            image: "img:1".to_string(),
            env: vec![],
            ports: None,
            storage_limit_gb: None,
            stop_timeout_s: None,
            desired_status: None,
        }
    }

    fn register_request(id: &str) -> RegisterNodeRequest {
        RegisterNodeRequest {
            id: id.to_string(),
            namespace: "corral".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_then_get_roundtrip() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();

        let created = manager.add_container(create_request("a")).await.unwrap();
        assert_eq!(created.node_id, "node-a");
        assert_eq!(created.desired_status, DesiredStatus::Running);

        let view = manager.get_container("a").await.unwrap();
        assert_eq!(view.container, created);
        assert!(!view.unscheduled);
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let manager = manager();
        manager.add_container(create_request("a")).await.unwrap();
        let err = manager.add_container(create_request("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_empty_id_invalid() {
        let manager = manager();
        let err = manager.add_container(create_request("")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_no_fresh_node_accepts_unscheduled() {
        let manager = manager();
        let created = manager.add_container(create_request("a")).await.unwrap();
        assert!(created.node_id.is_empty());

        let view = manager.get_container("a").await.unwrap();
        assert!(view.unscheduled);
    }

    #[tokio::test]
    async fn test_patch_preserves_identity_fields() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();

        let patched = manager
            .patch_container(
                "a",
                ContainerPatch {
                    desired_status: Some(DesiredStatus::Stopped),
                    image: Some("img:2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(patched.id, "a");
        assert_eq!(patched.node_id, "node-a");
        assert_eq!(patched.image, "img:2");
        assert_eq!(patched.desired_status, DesiredStatus::Stopped);
    }

    #[tokio::test]
    async fn test_patch_missing_container_not_found() {
        let manager = manager();
        let err = manager
            .patch_container("ghost", ContainerPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_serial_equivalence_under_concurrent_writers() {
        let manager = std::sync::Arc::new(manager());

        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("c{i:02}");
                manager.add_container(create_request(&id)).await.unwrap();
                manager
                    .patch_container(
                        &id,
                        ContainerPatch {
                            desired_status: Some(DesiredStatus::Stopped),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every interleaving lands in the same final store.
        let views = manager.list_containers().await;
        assert_eq!(views.len(), 16);
        for view in views {
            assert_eq!(view.container.desired_status, DesiredStatus::Stopped);
        }
    }

    #[tokio::test]
    async fn test_registration_idempotent() {
        let manager = manager();
        for _ in 0..5 {
            manager.register_node(register_request("node-a")).await.unwrap();
        }
        assert_eq!(manager.list_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_node_view_refreshes_last_seen_and_includes_marked() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();
        manager.remove_container("a").await.unwrap();

        let before = manager.get_node("node-a").await.unwrap().last_seen;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let view = manager.node_view("node-a").await.unwrap();
        assert!(view.last_seen >= before);
        assert_eq!(view.containers.len(), 1);
        assert!(view.containers[0].marked_for_deletion);
    }

    #[tokio::test]
    async fn test_two_phase_delete() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();

        manager.remove_container("a").await.unwrap();
        // Marked, still visible.
        assert!(manager.get_container("a").await.unwrap().container.marked_for_deletion);
        // Repeat delete is success.
        manager.remove_container("a").await.unwrap();

        // Agent confirms absence.
        manager
            .report_status("node-a", "a", ContainerStatus::Stopped)
            .await
            .unwrap();
        assert!(manager.get_container("a").await.is_err());

        // Now the id is truly gone.
        let err = manager.remove_container("a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unscheduled_delete_is_immediate() {
        let manager = manager();
        manager.add_container(create_request("a")).await.unwrap();
        manager.remove_container("a").await.unwrap();
        assert!(manager.get_container("a").await.is_err());
    }

    #[tokio::test]
    async fn test_running_report_does_not_finalize_marked_container() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();
        manager.remove_container("a").await.unwrap();

        manager
            .report_status("node-a", "a", ContainerStatus::Running)
            .await
            .unwrap();
        assert!(manager.get_container("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_status_change_fans_out_once() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();

        let mut sub = manager.subscribe_status("a").await.unwrap();

        // Same value reported repeatedly commits one change event.
        for _ in 0..3 {
            manager
                .report_status("node-a", "a", ContainerStatus::Running)
                .await
                .unwrap();
        }
        manager
            .report_status("node-a", "a", ContainerStatus::Stopped)
            .await
            .unwrap();

        assert_eq!(
            sub.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Running))
        );
        assert_eq!(
            sub.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Stopped))
        );
    }

    #[tokio::test]
    async fn test_report_from_non_owner_is_ignored() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();

        manager
            .report_status("node-b", "a", ContainerStatus::Running)
            .await
            .unwrap();
        assert!(manager.observed_status("a").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_missing_container_not_found() {
        let manager = manager();
        assert!(manager.subscribe_status("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_snapshot_then_changes() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();
        manager
            .report_status("node-a", "a", ContainerStatus::Running)
            .await
            .unwrap();

        let mut sub = manager.subscribe_status("a").await.unwrap();
        manager
            .report_status("node-a", "a", ContainerStatus::Stopped)
            .await
            .unwrap();

        assert_eq!(
            sub.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Running))
        );
        assert_eq!(
            sub.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Stopped))
        );
    }

    #[tokio::test]
    async fn test_deletion_closes_subscriptions_with_gone() {
        let manager = manager();
        manager.register_node(register_request("node-a")).await.unwrap();
        manager.add_container(create_request("a")).await.unwrap();

        let mut sub = manager.subscribe_status("a").await.unwrap();
        manager.remove_container("a").await.unwrap();
        manager
            .report_status("node-a", "a", ContainerStatus::Stopped)
            .await
            .unwrap();

        assert_eq!(sub.recv().await, Some(StatusEvent::Gone));
        assert_eq!(sub.recv().await, None);
    }
}
