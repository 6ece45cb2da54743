//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the verbs the reconciler needs from a
//! container runtime:
//!
//! - Pulling images and creating/deleting containers
//! - Starting and killing tasks
//! - Listing containers and observing task status
//!
//! Every verb is namespace-scoped; deadlines are applied by the caller. A
//! mock implementation is provided for testing and development; a real
//! driver (e.g. a containerd adapter speaking `runtime_socket`) implements
//! the same trait out of tree.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use corral_models::{Container, ContainerStatus};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// POSIX signal delivered to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination request.
    Term,

    /// Forceful kill.
    Kill,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Term => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Resolves with the task's exit code once the process exits.
pub type ExitWaiter = oneshot::Receiver<i32>;

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch an image. Idempotent; caches locally.
    async fn pull(&self, namespace: &str, image: &str) -> Result<()>;

    /// Create a container from a spec. Reuses an existing container with the
    /// same spec; fails when the id exists with a different one.
    async fn create(&self, namespace: &str, spec: &Container) -> Result<()>;

    /// Start the container's task. No-op if already running.
    async fn start(&self, namespace: &str, id: &str) -> Result<()>;

    /// Deliver a signal to the task. The returned waiter resolves on exit.
    async fn kill(&self, namespace: &str, id: &str, signal: Signal) -> Result<ExitWaiter>;

    /// Delete the container. Fails while a task is still present.
    async fn delete(&self, namespace: &str, id: &str) -> Result<()>;

    /// List container ids in the namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<String>>;

    /// Observe task status. Errors are the `unknown` sentinel; they are
    /// never persisted as state.
    async fn status(&self, namespace: &str, id: &str) -> Result<ContainerStatus>;
}

struct MockContainer {
    spec: Container,
    running: bool,
}

#[derive(Default)]
struct MockState {
    images: Vec<String>,
    containers: HashMap<(String, String), MockContainer>,
    verbs: Vec<String>,
    fail_next_pulls: u32,
    fail_next_lists: u32,
    fail_all_starts: bool,
    ignore_sigterm: bool,
}

/// Mock runtime for testing and development.
///
/// Fully functional in-memory implementation with failure injection and a
/// verb log so tests can assert the exact driver call sequence.
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make the next `n` pulls fail (transient driver error injection).
    pub fn fail_next_pulls(&self, n: u32) {
        self.state.lock().unwrap().fail_next_pulls = n;
    }

    /// Make the next `n` list calls fail (transient driver error injection).
    pub fn fail_next_lists(&self, n: u32) {
        self.state.lock().unwrap().fail_next_lists = n;
    }

    /// Make every start fail (persistent driver error injection).
    pub fn fail_all_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_all_starts = fail;
    }

    /// Make tasks survive SIGTERM so stop escalation paths run.
    pub fn ignore_sigterm(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_sigterm = ignore;
    }

    /// Place a container directly into the runtime, bypassing the driver
    /// verbs. Used to simulate orphans.
    pub fn seed_container(&self, namespace: &str, spec: Container, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            (namespace.to_string(), spec.id.clone()),
            MockContainer { spec, running },
        );
    }

    /// The driver verbs invoked so far, in order.
    pub fn verbs(&self) -> Vec<String> {
        self.state.lock().unwrap().verbs.clone()
    }

    /// Forget the recorded verbs.
    pub fn clear_verbs(&self) {
        self.state.lock().unwrap().verbs.clear();
    }

    pub fn is_running(&self, namespace: &str, id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(&(namespace.to_string(), id.to_string()))
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn container_ids(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .containers
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn record(state: &mut MockState, verb: String) {
        debug!(verb = %verb, "[MOCK] runtime verb");
        state.verbs.push(verb);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, _namespace: &str, image: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("pull {image}"));
        if state.fail_next_pulls > 0 {
            state.fail_next_pulls -= 1;
            anyhow::bail!("image pull failed: {image}");
        }
        if !state.images.iter().any(|i| i == image) {
            state.images.push(image.to_string());
        }
        Ok(())
    }

    async fn create(&self, namespace: &str, spec: &Container) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("create {}", spec.id));

        let key = (namespace.to_string(), spec.id.clone());
        if let Some(existing) = state.containers.get(&key) {
            if existing.spec.image != spec.image || existing.spec.env != spec.env {
                anyhow::bail!("container '{}' exists with a different spec", spec.id);
            }
            // Same spec: reuse.
            return Ok(());
        }

        state.containers.insert(
            key,
            MockContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        info!(container_id = %spec.id, image = %spec.image, "[MOCK] Container created");
        Ok(())
    }

    async fn start(&self, namespace: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("start {id}"));
        if state.fail_all_starts {
            anyhow::bail!("task start failed: {id}");
        }

        let key = (namespace.to_string(), id.to_string());
        let container = state
            .containers
            .get_mut(&key)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;
        container.running = true;
        Ok(())
    }

    async fn kill(&self, namespace: &str, id: &str, signal: Signal) -> Result<ExitWaiter> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("kill {id} {signal}"));

        let ignore_sigterm = state.ignore_sigterm;
        let key = (namespace.to_string(), id.to_string());
        let container = state
            .containers
            .get_mut(&key)
            .ok_or_else(|| anyhow::anyhow!("no such container: {id}"))?;

        let (tx, rx) = oneshot::channel();
        if signal == Signal::Term && ignore_sigterm {
            // Task shrugs the signal off; the waiter never resolves.
            std::mem::forget(tx);
        } else {
            container.running = false;
            let _ = tx.send(0);
        }
        Ok(rx)
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("delete {id}"));

        let key = (namespace.to_string(), id.to_string());
        match state.containers.get(&key) {
            Some(container) if container.running => {
                anyhow::bail!("container '{id}' still has a running task")
            }
            Some(_) => {
                state.containers.remove(&key);
                Ok(())
            }
            None => anyhow::bail!("no such container: {id}"),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_lists > 0 {
                state.fail_next_lists -= 1;
                anyhow::bail!("runtime unavailable");
            }
        }
        Ok(self.container_ids(namespace))
    }

    async fn status(&self, namespace: &str, id: &str) -> Result<ContainerStatus> {
        let state = self.state.lock().unwrap();
        let key = (namespace.to_string(), id.to_string());
        match state.containers.get(&key) {
            Some(container) if container.running => Ok(ContainerStatus::Running),
            Some(_) => Ok(ContainerStatus::Stopped),
            None => anyhow::bail!("no such container: {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_models::{ContainerDefaults, CreateContainerRequest};

    fn spec(id: &str, image: &str) -> Container {
        ContainerDefaults::default().materialize(CreateContainerRequest {
            id: id.to_string(),
            image: image.to_string(),
            env: vec![],
            ports: None,
            storage_limit_gb: None,
            stop_timeout_s: None,
            desired_status: None,
        })
    }

    #[tokio::test]
    async fn test_create_start_status() {
        let runtime = MockRuntime::new();
        runtime.pull("ns", "img:1").await.unwrap();
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        assert_eq!(
            runtime.status("ns", "a").await.unwrap(),
            ContainerStatus::Stopped
        );

        runtime.start("ns", "a").await.unwrap();
        assert_eq!(
            runtime.status("ns", "a").await.unwrap(),
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent_for_same_spec() {
        let runtime = MockRuntime::new();
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        assert!(runtime.create("ns", &spec("a", "img:2")).await.is_err());
    }

    #[tokio::test]
    async fn test_kill_resolves_exit_waiter() {
        let runtime = MockRuntime::new();
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        runtime.start("ns", "a").await.unwrap();

        let waiter = runtime.kill("ns", "a", Signal::Term).await.unwrap();
        assert_eq!(waiter.await.unwrap(), 0);
        assert!(!runtime.is_running("ns", "a"));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_leaves_task_running() {
        let runtime = MockRuntime::new();
        runtime.ignore_sigterm(true);
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        runtime.start("ns", "a").await.unwrap();

        let _waiter = runtime.kill("ns", "a", Signal::Term).await.unwrap();
        assert!(runtime.is_running("ns", "a"));

        let waiter = runtime.kill("ns", "a", Signal::Kill).await.unwrap();
        assert_eq!(waiter.await.unwrap(), 0);
        assert!(!runtime.is_running("ns", "a"));
    }

    #[tokio::test]
    async fn test_delete_requires_stopped_task() {
        let runtime = MockRuntime::new();
        runtime.create("ns", &spec("a", "img:1")).await.unwrap();
        runtime.start("ns", "a").await.unwrap();
        assert!(runtime.delete("ns", "a").await.is_err());

        runtime.kill("ns", "a", Signal::Kill).await.unwrap();
        runtime.delete("ns", "a").await.unwrap();
        assert!(runtime.list("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let runtime = MockRuntime::new();
        runtime.create("ns-a", &spec("a", "img:1")).await.unwrap();
        runtime.create("ns-b", &spec("b", "img:1")).await.unwrap();

        assert_eq!(runtime.list("ns-a").await.unwrap(), vec!["a"]);
        assert_eq!(runtime.list("ns-b").await.unwrap(), vec!["b"]);
        assert!(runtime.status("ns-a", "b").await.is_err());
    }

    #[tokio::test]
    async fn test_pull_failure_injection() {
        let runtime = MockRuntime::new();
        runtime.fail_next_pulls(1);
        assert!(runtime.pull("ns", "img:1").await.is_err());
        assert!(runtime.pull("ns", "img:1").await.is_ok());
    }
}
