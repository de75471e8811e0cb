// Cluster membership view
// One component owns the node table and the active/inactive state of every
// member, behind its own lock, and publishes transitions to subscribers.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::node::{ControllerNode, NodeId, NodeState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipEventType {
    NodeAdded,
    NodeActivated,
    NodeDeactivated,
    NodeRemoved,
}

#[derive(Clone, Debug)]
pub struct MembershipEvent {
    pub kind: MembershipEventType,
    pub node: ControllerNode,
}

struct MemberRecord {
    node: ControllerNode,
    state: NodeState,
    last_seen: Instant,
}

pub struct Membership {
    local: ControllerNode,
    members: RwLock<HashMap<NodeId, MemberRecord>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    /// Creates a view containing only the local node, which is always active.
    pub fn new(local: ControllerNode) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut members = HashMap::new();
        members.insert(
            local.id.clone(),
            MemberRecord {
                node: local.clone(),
                state: NodeState::Active,
                last_seen: Instant::now(),
            },
        );
        Self {
            local,
            members: RwLock::new(members),
            events,
        }
    }

    /// Creates a view in which every given node is already active.
    pub fn with_active_nodes(local: ControllerNode, nodes: impl IntoIterator<Item = ControllerNode>) -> Self {
        let membership = Self::new(local);
        for node in nodes {
            let id = node.id.clone();
            membership.add_node(node);
            membership.mark_active(&id);
        }
        membership
    }

    pub fn local_node(&self) -> &ControllerNode {
        &self.local
    }

    pub fn add_node(&self, node: ControllerNode) {
        let mut members = self.members.write();
        if members.contains_key(&node.id) {
            return;
        }
        debug!(node = %node, "Adding cluster member");
        members.insert(
            node.id.clone(),
            MemberRecord {
                node: node.clone(),
                state: NodeState::Inactive,
                last_seen: Instant::now(),
            },
        );
        drop(members);
        self.publish(MembershipEventType::NodeAdded, node);
    }

    pub fn remove_node(&self, id: &NodeId) {
        if *id == self.local.id {
            return;
        }
        let removed = self.members.write().remove(id);
        if let Some(record) = removed {
            info!(node = %record.node, "Removed cluster member");
            self.publish(MembershipEventType::NodeRemoved, record.node);
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<ControllerNode> {
        self.members.read().get(id).map(|r| r.node.clone())
    }

    pub fn nodes(&self) -> Vec<ControllerNode> {
        self.members.read().values().map(|r| r.node.clone()).collect()
    }

    pub fn active_nodes(&self) -> Vec<ControllerNode> {
        self.members
            .read()
            .values()
            .filter(|r| r.state == NodeState::Active)
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn state(&self, id: &NodeId) -> Option<NodeState> {
        self.members.read().get(id).map(|r| r.state)
    }

    /// Records that `id` was heard from. Unknown ids are ignored.
    pub fn mark_active(&self, id: &NodeId) {
        let activated = {
            let mut members = self.members.write();
            let Some(record) = members.get_mut(id) else {
                return;
            };
            record.last_seen = Instant::now();
            if record.state == NodeState::Active {
                None
            } else {
                record.state = NodeState::Active;
                Some(record.node.clone())
            }
        };
        if let Some(node) = activated {
            info!(node = %node, "Cluster member is up");
            self.publish(MembershipEventType::NodeActivated, node);
        }
    }

    pub fn mark_inactive(&self, id: &NodeId) {
        if *id == self.local.id {
            return;
        }
        let deactivated = {
            let mut members = self.members.write();
            match members.get_mut(id) {
                Some(record) if record.state == NodeState::Active => {
                    record.state = NodeState::Inactive;
                    Some(record.node.clone())
                }
                _ => None,
            }
        };
        if let Some(node) = deactivated {
            info!(node = %node, "Cluster member is down");
            self.publish(MembershipEventType::NodeDeactivated, node);
        }
    }

    /// Deactivates every remote member not heard from within `max_silence`.
    pub fn sweep(&self, max_silence: Duration) {
        let now = Instant::now();
        let stale: Vec<NodeId> = self
            .members
            .read()
            .values()
            .filter(|r| {
                r.node.id != self.local.id
                    && r.state == NodeState::Active
                    && now.duration_since(r.last_seen) > max_silence
            })
            .map(|r| r.node.id.clone())
            .collect();
        for id in stale {
            self.mark_inactive(&id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Waits until at least `count` members are active or `timeout` elapses.
    /// Returns whether the count was reached.
    pub async fn wait_for_active(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.subscribe();
        loop {
            if self.active_nodes().len() >= count {
                return true;
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.active_nodes().len() >= count;
                }
            }
        }
    }

    fn publish(&self, kind: MembershipEventType, node: ControllerNode) {
        // no receivers is fine
        let _ = self.events.send(MembershipEvent { kind, node });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> ControllerNode {
        ControllerNode::new(id, "127.0.0.1", 9876)
    }

    #[test]
    fn test_local_node_is_active() {
        let membership = Membership::new(node("a"));
        assert_eq!(membership.state(&"a".into()), Some(NodeState::Active));
        assert_eq!(membership.active_nodes().len(), 1);
    }

    #[test]
    fn test_transitions_publish_events() {
        let membership = Membership::new(node("a"));
        let mut events = membership.subscribe();

        membership.add_node(node("b"));
        membership.mark_active(&"b".into());
        membership.mark_active(&"b".into());
        membership.mark_inactive(&"b".into());

        let kinds: Vec<MembershipEventType> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MembershipEventType::NodeAdded,
                MembershipEventType::NodeActivated,
                MembershipEventType::NodeDeactivated,
            ]
        );
    }

    #[test]
    fn test_local_node_cannot_be_removed_or_deactivated() {
        let membership = Membership::new(node("a"));
        membership.mark_inactive(&"a".into());
        membership.remove_node(&"a".into());
        assert_eq!(membership.state(&"a".into()), Some(NodeState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_deactivates_silent_members() {
        let membership = Membership::with_active_nodes(node("a"), vec![node("b")]);
        tokio::time::advance(Duration::from_secs(5)).await;
        membership.sweep(Duration::from_secs(3));
        assert_eq!(membership.state(&"b".into()), Some(NodeState::Inactive));
        assert_eq!(membership.state(&"a".into()), Some(NodeState::Active));
    }

    #[tokio::test]
    async fn test_wait_for_active_returns_when_quorum_visible() {
        let membership = std::sync::Arc::new(Membership::new(node("a")));
        membership.add_node(node("b"));

        let waiter = {
            let membership = membership.clone();
            tokio::spawn(async move { membership.wait_for_active(2, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        membership.mark_active(&"b".into());

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_active_gives_up_after_timeout() {
        let membership = Membership::new(node("a"));
        assert!(!membership.wait_for_active(3, Duration::from_millis(100)).await);
    }
}
