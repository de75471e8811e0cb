// In-process cluster messaging
// Every joined node gets a communicator that delivers directly into the target
// node's subscriber table. Nodes can be isolated to simulate partitions.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::communicator::{
    ClusterCommunicator, ClusterMessageHandler, MessagingError, SubscriberRegistry,
};
use crate::message::{ClusterMessage, MessageSubject};
use crate::node::{ControllerNode, NodeId};

#[derive(Default)]
pub struct LocalClusterHub {
    endpoints: DashMap<NodeId, Arc<SubscriberRegistry>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalClusterHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, node: ControllerNode) -> Arc<LocalCommunicator> {
        let subscribers = Arc::new(SubscriberRegistry::new());
        self.endpoints.insert(node.id.clone(), subscribers.clone());
        Arc::new(LocalCommunicator {
            hub: self.clone(),
            node,
            subscribers,
        })
    }

    pub fn leave(&self, id: &NodeId) {
        self.endpoints.remove(id);
    }

    /// Cuts `id` off from every other node until [`heal`](Self::heal) is called.
    pub fn isolate(&self, id: &NodeId) {
        self.isolated.write().insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.isolated.write().remove(id);
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }

    fn resolve(
        &self,
        from: &NodeId,
        to: &NodeId,
        subject: &MessageSubject,
    ) -> Result<Arc<dyn ClusterMessageHandler>, MessagingError> {
        if from != to {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(MessagingError::Unreachable(
                    to.clone(),
                    "partitioned".to_string(),
                ));
            }
        }
        let endpoint = self
            .endpoints
            .get(to)
            .map(|e| e.value().clone())
            .ok_or_else(|| MessagingError::UnknownNode(to.clone()))?;
        endpoint
            .get(subject)
            .ok_or_else(|| MessagingError::NoSubscriber {
                node: to.clone(),
                subject: subject.clone(),
            })
    }
}

pub struct LocalCommunicator {
    hub: Arc<LocalClusterHub>,
    node: ControllerNode,
    subscribers: Arc<SubscriberRegistry>,
}

impl LocalCommunicator {
    fn message(&self, subject: &MessageSubject, payload: Bytes) -> ClusterMessage {
        ClusterMessage::new(self.node.id.clone(), subject.clone(), payload)
    }

    fn fire(&self, subject: &MessageSubject, payload: Bytes, to: &NodeId) -> Result<(), MessagingError> {
        let handler = self.hub.resolve(&self.node.id, to, subject)?;
        let message = self.message(subject, payload);
        tokio::spawn(async move {
            handler.handle(message).await;
        });
        Ok(())
    }

    fn fan_out(&self, subject: &MessageSubject, payload: &Bytes, include_self: bool) {
        for id in self.hub.node_ids() {
            if id == self.node.id && !include_self {
                continue;
            }
            if let Err(e) = self.fire(subject, payload.clone(), &id) {
                trace!(to = %id, subject = %subject, error = %e, "Broadcast not delivered");
            }
        }
    }
}

#[async_trait]
impl ClusterCommunicator for LocalCommunicator {
    fn local_node(&self) -> &ControllerNode {
        &self.node
    }

    async fn broadcast(&self, subject: MessageSubject, payload: Bytes) -> Result<(), MessagingError> {
        self.fan_out(&subject, &payload, false);
        Ok(())
    }

    async fn broadcast_include_self(
        &self,
        subject: MessageSubject,
        payload: Bytes,
    ) -> Result<(), MessagingError> {
        self.fan_out(&subject, &payload, true);
        Ok(())
    }

    async fn unicast(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<(), MessagingError> {
        self.fire(&subject, payload, to)
    }

    async fn send_and_receive(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<Bytes, MessagingError> {
        let handler = self.hub.resolve(&self.node.id, to, &subject)?;
        let message = self.message(&subject, payload);
        // run on its own task so the responder never shares the caller's stack
        let reply = tokio::spawn(async move { handler.handle(message).await })
            .await
            .map_err(|e| MessagingError::Unreachable(to.clone(), e.to_string()))?;
        reply.ok_or_else(|| MessagingError::NoResponse(to.clone()))
    }

    fn add_subscriber(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>) {
        self.subscribers.add(subject, handler);
    }

    fn remove_subscriber(&self, subject: &MessageSubject) {
        self.subscribers.remove(subject);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::communicator::handler_fn;

    const ECHO: MessageSubject = MessageSubject::from_static("echo");

    fn node(id: &str) -> ControllerNode {
        ControllerNode::new(id, "127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let hub = LocalClusterHub::new();
        let a = hub.join(node("a"));
        let b = hub.join(node("b"));
        b.add_subscriber(
            ECHO,
            handler_fn(|msg: ClusterMessage| async move {
                Some(Bytes::from(format!("{}:{}", msg.sender, msg.payload.len())))
            }),
        );

        let reply = a
            .send_and_receive(ECHO, Bytes::from_static(b"abc"), &"b".into())
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"a:3"));
    }

    #[tokio::test]
    async fn test_missing_subscriber_and_unknown_node() {
        let hub = LocalClusterHub::new();
        let a = hub.join(node("a"));
        hub.join(node("b"));

        assert!(matches!(
            a.send_and_receive(ECHO, Bytes::new(), &"b".into()).await,
            Err(MessagingError::NoSubscriber { .. })
        ));
        assert!(matches!(
            a.send_and_receive(ECHO, Bytes::new(), &"zz".into()).await,
            Err(MessagingError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_include_self() {
        let hub = LocalClusterHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut comms = Vec::new();
        for id in ["a", "b", "c"] {
            let comm = hub.join(node(id));
            let tx = tx.clone();
            comm.add_subscriber(
                ECHO,
                handler_fn(move |msg: ClusterMessage| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(msg.sender);
                        None
                    }
                }),
            );
            comms.push(comm);
        }

        comms[0].broadcast(ECHO, Bytes::new()).await.unwrap();
        comms[0].broadcast_include_self(ECHO, Bytes::new()).await.unwrap();

        let mut received = 0;
        while tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            received += 1;
        }
        // 2 from the plain broadcast, 3 from the one that includes the sender
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_isolated_node_is_unreachable() {
        let hub = LocalClusterHub::new();
        let a = hub.join(node("a"));
        let b = hub.join(node("b"));
        b.add_subscriber(ECHO, handler_fn(|msg: ClusterMessage| async move { Some(msg.payload) }));

        hub.isolate(&"b".into());
        assert!(matches!(
            a.send_and_receive(ECHO, Bytes::new(), &"b".into()).await,
            Err(MessagingError::Unreachable(..))
        ));

        hub.heal(&"b".into());
        assert!(a.send_and_receive(ECHO, Bytes::new(), &"b".into()).await.is_ok());
    }
}
