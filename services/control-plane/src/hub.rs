//! Per-container fan-out of status changes to subscribers.
//!
//! The hub sits between the state manager and any number of status
//! subscribers (SSE clients). Delivery rules:
//!
//! - Each subscriber owns a bounded sink; publishing never blocks and never
//!   awaits, so the state manager can fan out while holding its write guard.
//! - When a sink is full the oldest unread value is dropped and a `lagged`
//!   marker takes its place; consecutive drops collapse into one marker.
//! - Deleting a container delivers a terminal `gone` marker to every
//!   subscriber for that id and closes their sinks.
//!
//! The sink is deliberately its own small primitive rather than a rexported
//! channel type: the drop-oldest-with-marker policy is part of the contract,
//! and no concurrency primitive leaks through the interface.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use corral_models::ContainerStatus;
use tokio::sync::Notify;
use tracing::debug;

/// Number of unread values a subscriber may buffer before it lags.
pub const SINK_CAPACITY: usize = 8;

/// One delivery to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A committed status value.
    Status(ContainerStatus),

    /// At least one value was dropped because this subscriber was slow.
    Lagged,

    /// The container was deleted; no further values will arrive.
    Gone,
}

struct SinkState {
    queue: VecDeque<ContainerStatus>,

    /// Values were dropped since the subscriber last read; delivered as one
    /// `Lagged` marker ahead of whatever survives in the queue.
    lagged: bool,

    /// Delivered once ahead of close.
    gone: bool,

    closed: bool,
}

struct SinkShared {
    state: Mutex<SinkState>,
    notify: Notify,
}

impl SinkShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                queue: VecDeque::with_capacity(SINK_CAPACITY),
                lagged: false,
                gone: false,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, status: ContainerStatus) {
        let mut state = self.state.lock().expect("sink lock poisoned");
        if state.closed || state.gone {
            return;
        }
        if state.queue.len() >= SINK_CAPACITY {
            state.queue.pop_front();
            state.lagged = true;
        }
        state.queue.push_back(status);
        drop(state);
        self.notify.notify_one();
    }

    fn push_gone(&self) {
        let mut state = self.state.lock().expect("sink lock poisoned");
        if state.closed || state.gone {
            return;
        }
        state.gone = true;
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("sink lock poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("sink lock poisoned").closed
    }
}

/// Receiving half of a subscription.
///
/// Dropping the handle unsubscribes. State machine per subscription:
/// `active → (active | lagged)* → closed`.
pub struct StatusSubscription {
    container_id: String,
    shared: Arc<SinkShared>,
}

impl StatusSubscription {
    /// The container this subscription is bound to.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Receive the next event. Returns `None` once the sink is closed and
    /// drained. `Gone` is always the last event before `None`.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            {
                let mut state = self.shared.state.lock().expect("sink lock poisoned");
                if state.lagged {
                    state.lagged = false;
                    return Some(StatusEvent::Lagged);
                }
                if let Some(status) = state.queue.pop_front() {
                    return Some(StatusEvent::Status(status));
                }
                if state.gone {
                    state.gone = false;
                    state.closed = true;
                    return Some(StatusEvent::Gone);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Stop delivery. Idempotent; after this returns no further values reach
    /// the sink.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Registry of live subscriptions, keyed by container id.
///
/// Publish paths take a std mutex and never await; callers may hold an async
/// write guard across them.
pub struct SubscriptionHub {
    subscribers: Mutex<HashMap<String, Vec<Weak<SinkShared>>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber for `container_id`. When `snapshot` is
    /// given it is delivered first, as the pre-subscription value.
    pub fn subscribe(
        &self,
        container_id: &str,
        snapshot: Option<ContainerStatus>,
    ) -> StatusSubscription {
        let shared = Arc::new(SinkShared::new());
        if let Some(status) = snapshot {
            shared.push(status);
        }

        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        subscribers
            .entry(container_id.to_string())
            .or_default()
            .push(Arc::downgrade(&shared));

        debug!(container_id, "Status subscription created");
        StatusSubscription {
            container_id: container_id.to_string(),
            shared,
        }
    }

    /// Fan a committed status value out to every live subscriber.
    pub fn publish(&self, container_id: &str, status: ContainerStatus) {
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        let Some(sinks) = subscribers.get_mut(container_id) else {
            return;
        };

        sinks.retain(|weak| match weak.upgrade() {
            Some(shared) if !shared.is_closed() => {
                shared.push(status);
                true
            }
            _ => false,
        });

        if sinks.is_empty() {
            subscribers.remove(container_id);
        }
    }

    /// Deliver the terminal `gone` marker and drop the container's entry.
    pub fn publish_gone(&self, container_id: &str) {
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        let Some(sinks) = subscribers.remove(container_id) else {
            return;
        };

        for weak in sinks {
            if let Some(shared) = weak.upgrade() {
                shared.push_gone();
            }
        }
        debug!(container_id, "Subscriptions closed with gone marker");
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_values_in_order() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe("a", None);

        hub.publish("a", ContainerStatus::Running);
        hub.publish("a", ContainerStatus::Stopped);

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
    async fn test_snapshot_delivered_first() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe("a", Some(ContainerStatus::Running));
        hub.publish("a", ContainerStatus::Stopped);

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
    async fn test_slow_subscriber_lags_and_keeps_newest() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe("a", None);

        // Overflow the sink without reading. Values alternate so the final
        // window is predictable.
        for i in 0..SINK_CAPACITY + 4 {
            let status = if i % 2 == 0 {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            };
            hub.publish("a", status);
        }

        // One lag marker in place of everything dropped, then the newest
        // SINK_CAPACITY values.
        assert_eq!(sub.recv().await, Some(StatusEvent::Lagged));
        let mut received = Vec::new();
        for _ in 0..SINK_CAPACITY {
            match sub.recv().await {
                Some(StatusEvent::Status(s)) => received.push(s),
                other => panic!("expected status, got {other:?}"),
            }
        }
        assert_eq!(received.len(), SINK_CAPACITY);
        // Last published value survives.
        assert_eq!(received.last(), Some(&ContainerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_unread_subscriber() {
        let hub = SubscriptionHub::new();
        let _sub = hub.subscribe("a", None);

        // A subscriber that never reads must not stall the publisher.
        for _ in 0..1000 {
            hub.publish("a", ContainerStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_gone_is_terminal() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe("a", None);

        hub.publish("a", ContainerStatus::Running);
        hub.publish_gone("a");
        // Published after gone: dropped.
        hub.publish("a", ContainerStatus::Stopped);

        assert_eq!(
            sub.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Running))
        );
        assert_eq!(sub.recv().await, Some(StatusEvent::Gone));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let hub = SubscriptionHub::new();
        let mut sub = hub.subscribe("a", None);

        sub.close();
        sub.close(); // idempotent
        hub.publish("a", ContainerStatus::Running);

        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let hub = SubscriptionHub::new();
        let sub = hub.subscribe("a", None);
        drop(sub);

        hub.publish("a", ContainerStatus::Running);
        assert!(hub.subscribers.lock().unwrap().get("a").is_none());
    }

    #[tokio::test]
    async fn test_independent_containers_do_not_cross() {
        let hub = SubscriptionHub::new();
        let mut sub_a = hub.subscribe("a", None);
        let mut sub_b = hub.subscribe("b", None);

        hub.publish("a", ContainerStatus::Running);
        hub.publish("b", ContainerStatus::Stopped);

        assert_eq!(
            sub_a.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Running))
        );
        assert_eq!(
            sub_b.recv().await,
            Some(StatusEvent::Status(ContainerStatus::Stopped))
        );
    }
}
