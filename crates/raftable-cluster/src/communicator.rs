// Cluster communication service abstraction

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::message::{ClusterMessage, MessageSubject};
use crate::node::{ControllerNode, NodeId};

#[derive(thiserror::Error, Debug)]
pub enum MessagingError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node {node} has no subscriber for subject {subject}")]
    NoSubscriber { node: NodeId, subject: MessageSubject },

    #[error("node {0} did not answer")]
    NoResponse(NodeId),

    #[error("node {0} is unreachable: {1}")]
    Unreachable(NodeId, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("communicator is closed")]
    Closed,
}

/// Handles messages delivered for one subject.
///
/// The returned bytes are sent back to the requester for request/response
/// exchanges and discarded for one-way messages. `None` leaves a request unanswered.
#[async_trait]
pub trait ClusterMessageHandler: Send + Sync {
    async fn handle(&self, message: ClusterMessage) -> Option<Bytes>;
}

#[async_trait]
pub trait ClusterCommunicator: Send + Sync {
    fn local_node(&self) -> &ControllerNode;

    /// Sends to every known node except the local one.
    async fn broadcast(&self, subject: MessageSubject, payload: Bytes) -> Result<(), MessagingError>;

    /// Sends to every known node including the local one.
    async fn broadcast_include_self(
        &self,
        subject: MessageSubject,
        payload: Bytes,
    ) -> Result<(), MessagingError>;

    async fn unicast(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<(), MessagingError>;

    async fn send_and_receive(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<Bytes, MessagingError>;

    fn add_subscriber(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>);

    fn remove_subscriber(&self, subject: &MessageSubject);
}

/// Subject to handler table shared by communicator implementations.
#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: DashMap<MessageSubject, Arc<dyn ClusterMessageHandler>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>) {
        debug!(subject = %subject, "Registering cluster message subscriber");
        self.handlers.insert(subject, handler);
    }

    pub fn remove(&self, subject: &MessageSubject) {
        if self.handlers.remove(subject).is_some() {
            debug!(subject = %subject, "Removed cluster message subscriber");
        }
    }

    pub fn get(&self, subject: &MessageSubject) -> Option<Arc<dyn ClusterMessageHandler>> {
        self.handlers.get(subject).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ClusterMessageHandler for FnHandler<F>
where
    F: Fn(ClusterMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Bytes>> + Send + 'static,
{
    async fn handle(&self, message: ClusterMessage) -> Option<Bytes> {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a subscriber.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ClusterMessageHandler>
where
    F: Fn(ClusterMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Bytes>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
