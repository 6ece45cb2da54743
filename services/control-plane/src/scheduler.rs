//! Trivial node assignment.
//!
//! Placement policy is deliberately minimal: a new container goes to any
//! node whose agent has been seen recently, ties broken by lexicographic
//! node id. No bin-packing, affinity, or preemption.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_models::Node;

/// True when the node's agent has contacted us within `expiry`.
pub fn is_fresh(node: &Node, now: DateTime<Utc>, expiry: Duration) -> bool {
    let age = now.signed_duration_since(node.last_seen);
    age.to_std().map(|age| age <= expiry).unwrap_or(true)
}

/// Pick the node a new container should land on, or `None` when no fresh
/// node exists (the container is accepted unscheduled).
pub fn pick_node(
    nodes: &BTreeMap<String, Node>,
    now: DateTime<Utc>,
    expiry: Duration,
) -> Option<String> {
    nodes
        .values()
        .find(|node| is_fresh(node, now, expiry))
        .map(|node| node.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn node(id: &str, seen_secs_ago: i64) -> Node {
        Node {
            id: id.to_string(),
            namespace: "corral".to_string(),
            last_seen: Utc::now() - TimeDelta::seconds(seen_secs_ago),
        }
    }

    fn nodes(entries: Vec<Node>) -> BTreeMap<String, Node> {
        entries.into_iter().map(|n| (n.id.clone(), n)).collect()
    }

    #[test]
    fn test_picks_lexicographically_smallest_fresh_node() {
        let nodes = nodes(vec![node("b", 0), node("a", 0), node("c", 0)]);
        let picked = pick_node(&nodes, Utc::now(), Duration::from_secs(15));
        assert_eq!(picked.as_deref(), Some("a"));
    }

    #[test]
    fn test_skips_stale_nodes() {
        let nodes = nodes(vec![node("a", 600), node("b", 0)]);
        let picked = pick_node(&nodes, Utc::now(), Duration::from_secs(15));
        assert_eq!(picked.as_deref(), Some("b"));
    }

    #[test]
    fn test_no_fresh_node_means_unscheduled() {
        let nodes = nodes(vec![node("a", 600)]);
        let picked = pick_node(&nodes, Utc::now(), Duration::from_secs(15));
        assert_eq!(picked, None);
    }

    #[test]
    fn test_future_last_seen_counts_as_fresh() {
        // Clock skew between control plane and agent must not unschedule.
        let n = node("a", -30);
        assert!(is_fresh(&n, Utc::now(), Duration::from_secs(15)));
    }
}
