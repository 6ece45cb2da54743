//! Reconciliation loop for converging node state.
//!
//! The reconciler:
//! - Periodically fetches this node's desired container set
//! - Diffs it against what the runtime actually holds
//! - Issues runtime verbs to converge, best-effort per container
//! - Reports observed status back to the control plane
//!
//! Ticks never overlap: an overrunning tick causes the next one to be
//! skipped, never queued. A single container's failure is logged and retried
//! next tick; it never aborts the rest of the tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use corral_models::{Container, ContainerStatus, DesiredStatus};
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ControlPlaneClient, NodeFetch};
use crate::config::Config;
use crate::runtime::{ContainerRuntime, Signal};

/// Deadline for image pull + container create, together.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for stopping and deleting one container.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for start/kill/status/list verbs.
const OP_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconciler for converging node state.
pub struct Reconciler {
    /// Control plane client.
    client: ControlPlaneClient,

    /// Runtime driver.
    runtime: Arc<dyn ContainerRuntime>,

    /// Runtime isolation scope for this node.
    namespace: String,

    /// Interval between ticks.
    poll_interval: Duration,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        Ok(Self {
            client: ControlPlaneClient::new(config)?,
            runtime,
            namespace: config.runtime_namespace.clone(),
            poll_interval: config.poll_interval,
        })
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            namespace = %self.namespace,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Reconciliation tick failed, will retry");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass: fetch, converge, report.
    pub async fn tick(&self) -> Result<()> {
        debug!("Starting reconciliation tick");

        let view = match self.client.fetch_node().await? {
            NodeFetch::View(view) => view,
            NodeFetch::NotRegistered => {
                info!("Node not registered, joining cluster");
                self.client.register(&self.namespace).await?;
                return Ok(());
            }
        };

        let reports = self.converge(&view.containers).await;

        for (container_id, status) in reports {
            if let Err(e) = self.client.report_status(&container_id, status).await {
                warn!(
                    container_id = %container_id,
                    error = %e,
                    "Failed to report container status"
                );
            }
        }

        Ok(())
    }

    /// Diff the desired set against the runtime and issue convergence verbs.
    ///
    /// Returns the status observations to report, one per container in the
    /// fetched set (marked-for-deletion containers included: their `stopped`
    /// observation is the deletion confirmation).
    pub async fn converge(&self, containers: &[Container]) -> Vec<(String, ContainerStatus)> {
        // Deterministic order throughout: BTree iteration is lexicographic.
        let mut fetched: BTreeMap<&str, &Container> = BTreeMap::new();
        let mut desired: BTreeMap<&str, &Container> = BTreeMap::new();
        for container in containers {
            fetched.insert(container.id.as_str(), container);
            if !container.marked_for_deletion {
                desired.insert(container.id.as_str(), container);
            }
        }

        let actual: BTreeSet<String> = match timeout(OP_TIMEOUT, self.runtime.list(&self.namespace))
            .await
        {
            Ok(Ok(ids)) => ids.into_iter().collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to enumerate runtime containers");
                return fetched
                    .keys()
                    .map(|id| (id.to_string(), ContainerStatus::Unknown))
                    .collect();
            }
            Err(_) => {
                warn!("Runtime enumeration timed out");
                return fetched
                    .keys()
                    .map(|id| (id.to_string(), ContainerStatus::Unknown))
                    .collect();
            }
        };

        // Removes first: in actual but not desired (orphans and containers
        // marked for deletion).
        for id in &actual {
            if !desired.contains_key(id.as_str()) {
                if let Err(e) = self
                    .remove_container(id, fetched.get(id.as_str()).copied())
                    .await
                {
                    warn!(container_id = %id, error = %e, "Failed to remove container");
                }
            }
        }

        // Creates: in desired but not actual.
        for (id, spec) in &desired {
            if !actual.contains(*id) {
                if let Err(e) = self.create_container(spec).await {
                    warn!(container_id = %id, error = %e, "Failed to create container");
                }
            }
        }

        // Matches: present in both; may need a start or stop transition.
        for (id, spec) in &desired {
            if actual.contains(*id) {
                if let Err(e) = self.match_container(spec).await {
                    warn!(container_id = %id, error = %e, "Failed to match container state");
                }
            }
        }

        self.observe(&fetched).await
    }

    /// Observe every container in the fetched set after the apply phase.
    ///
    /// Absent container ⇒ `stopped`; running task ⇒ `running`; any driver
    /// error ⇒ `unknown` for this tick only.
    async fn observe(
        &self,
        fetched: &BTreeMap<&str, &Container>,
    ) -> Vec<(String, ContainerStatus)> {
        let actual: Option<BTreeSet<String>> =
            match timeout(OP_TIMEOUT, self.runtime.list(&self.namespace)).await {
                Ok(Ok(ids)) => Some(ids.into_iter().collect()),
                _ => None,
            };

        let mut reports = Vec::with_capacity(fetched.len());
        for id in fetched.keys() {
            let status = match &actual {
                None => ContainerStatus::Unknown,
                Some(ids) if !ids.contains(*id) => ContainerStatus::Stopped,
                Some(_) => match timeout(OP_TIMEOUT, self.runtime.status(&self.namespace, id))
                    .await
                {
                    Ok(Ok(status)) => status,
                    _ => ContainerStatus::Unknown,
                },
            };
            reports.push((id.to_string(), status));
        }
        reports
    }

    /// Remove a container from the runtime: stop its task if one is running,
    /// then delete with cleanup. Orphans carry no spec and get no grace
    /// period.
    async fn remove_container(&self, id: &str, spec: Option<&Container>) -> Result<()> {
        let result = timeout(REMOVE_TIMEOUT, async {
            let status = self
                .runtime
                .status(&self.namespace, id)
                .await
                .unwrap_or(ContainerStatus::Unknown);

            if status == ContainerStatus::Running {
                match spec {
                    Some(spec) => {
                        self.stop_task(id, Duration::from_secs(spec.stop_timeout_s as u64))
                            .await?
                    }
                    None => {
                        let waiter = self.runtime.kill(&self.namespace, id, Signal::Kill).await?;
                        let _ = timeout(OP_TIMEOUT, waiter).await;
                    }
                }
            }

            self.runtime.delete(&self.namespace, id).await
        })
        .await;

        match result {
            Ok(result) => {
                if result.is_ok() {
                    info!(container_id = %id, "Container removed");
                }
                result
            }
            Err(_) => anyhow::bail!("remove timed out after {REMOVE_TIMEOUT:?}"),
        }
    }

    /// Pull, create, and (when desired running) start a container. Create is
    /// idempotent by id: an existing container with the same spec is reused.
    async fn create_container(&self, spec: &Container) -> Result<()> {
        let created = timeout(CREATE_TIMEOUT, async {
            self.runtime.pull(&self.namespace, &spec.image).await?;
            self.runtime.create(&self.namespace, spec).await
        })
        .await;

        match created {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("create timed out after {CREATE_TIMEOUT:?}"),
        }

        if spec.desired_status == DesiredStatus::Running {
            match timeout(OP_TIMEOUT, self.runtime.start(&self.namespace, &spec.id)).await {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("start timed out after {OP_TIMEOUT:?}"),
            }
        }

        info!(
            container_id = %spec.id,
            image = %spec.image,
            desired_status = %spec.desired_status,
            "Container created"
        );
        Ok(())
    }

    /// Transition an existing container toward its desired status.
    async fn match_container(&self, spec: &Container) -> Result<()> {
        let status = match timeout(OP_TIMEOUT, self.runtime.status(&self.namespace, &spec.id)).await
        {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("status timed out after {OP_TIMEOUT:?}"),
        };

        match (status, spec.desired_status) {
            (ContainerStatus::Stopped, DesiredStatus::Running) => {
                debug!(container_id = %spec.id, "Starting stopped container");
                match timeout(OP_TIMEOUT, self.runtime.start(&self.namespace, &spec.id)).await {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("start timed out after {OP_TIMEOUT:?}"),
                }
            }
            (ContainerStatus::Running, DesiredStatus::Stopped) => {
                debug!(container_id = %spec.id, "Stopping running container");
                self.stop_task(&spec.id, Duration::from_secs(spec.stop_timeout_s as u64))
                    .await?;
            }
            // Already matching, or status unknown this tick: leave it be.
            _ => {}
        }
        Ok(())
    }

    /// Stop a task gracefully: SIGTERM, then SIGKILL once the grace period
    /// elapses without an exit.
    async fn stop_task(&self, id: &str, grace: Duration) -> Result<()> {
        let waiter = match timeout(
            OP_TIMEOUT,
            self.runtime.kill(&self.namespace, id, Signal::Term),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("kill timed out after {OP_TIMEOUT:?}"),
        };

        if timeout(grace, waiter).await.is_err() {
            info!(container_id = %id, "Stop grace period exceeded, escalating to SIGKILL");
            let waiter = match timeout(
                OP_TIMEOUT,
                self.runtime.kill(&self.namespace, id, Signal::Kill),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("kill timed out after {OP_TIMEOUT:?}"),
            };
            let _ = timeout(OP_TIMEOUT, waiter).await;
        }

        Ok(())
    }
}
