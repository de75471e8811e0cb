// Server side of the consensus transport
// Decodes consensus RPCs arriving on cluster subjects and dispatches them on a
// bounded worker pool to whichever handler is currently registered.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use raftable_cluster::{ClusterCommunicator, ClusterMessage, handler_fn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::protocol::{
    CONSENSUS_SUBJECTS, POLL_SUBJECT, PING_SUBJECT, ProtocolHandler, Reply, SUBMIT_SUBJECT,
    SYNC_SUBJECT, decode, encode,
};

/// Attempts to find a registered handler before leaving a request unanswered
const HANDLER_LOOKUP_ATTEMPTS: u32 = 10;
const HANDLER_LOOKUP_BACKOFF: Duration = Duration::from_millis(1);

pub struct RaftProtocolServer {
    communicator: Arc<dyn ClusterCommunicator>,
    handler: RwLock<Option<Arc<dyn ProtocolHandler>>>,
    workers: Arc<Semaphore>,
}

impl RaftProtocolServer {
    pub fn new(communicator: Arc<dyn ClusterCommunicator>, dispatch_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            communicator,
            handler: RwLock::new(None),
            workers: Arc::new(Semaphore::new(dispatch_workers.max(1))),
        })
    }

    pub fn register_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn unregister_handler(&self) {
        self.handler.write().take();
    }

    /// Subscribe to every consensus subject
    pub fn start(self: &Arc<Self>) {
        for subject in CONSENSUS_SUBJECTS {
            let server = Arc::clone(self);
            self.communicator.add_subscriber(
                subject,
                handler_fn(move |message: ClusterMessage| {
                    let server = Arc::clone(&server);
                    async move { server.dispatch(message).await }
                }),
            );
        }
        debug!(
            node_id = %self.communicator.local_node().id,
            "Consensus protocol server started"
        );
    }

    pub fn stop(&self) {
        for subject in CONSENSUS_SUBJECTS {
            self.communicator.remove_subscriber(&subject);
        }
        self.unregister_handler();
        debug!(
            node_id = %self.communicator.local_node().id,
            "Consensus protocol server stopped"
        );
    }

    /// The registered handler, waiting out a brief role transition
    async fn current_handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        let mut backoff = HANDLER_LOOKUP_BACKOFF;
        for attempt in 0..HANDLER_LOOKUP_ATTEMPTS {
            if let Some(handler) = self.handler.read().clone() {
                return Some(handler);
            }
            if attempt + 1 < HANDLER_LOOKUP_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        None
    }

    async fn dispatch(self: Arc<Self>, message: ClusterMessage) -> Option<Bytes> {
        let Some(handler) = self.current_handler().await else {
            debug!(subject = %message.subject, "No consensus handler registered, leaving request unanswered");
            return None;
        };
        let Ok(_permit) = self.workers.clone().acquire_owned().await else {
            return None;
        };

        let subject = message.subject.clone();
        // run on its own task so a panicking handler is logged instead of taking the subscriber down
        let task = tokio::spawn(async move { handle(handler, message).await });
        match task.await {
            Ok(reply) => reply,
            Err(e) => {
                error!(subject = %subject, "Consensus handler failed: {}", e);
                None
            }
        }
    }
}

async fn handle(handler: Arc<dyn ProtocolHandler>, message: ClusterMessage) -> Option<Bytes> {
    let payload = &message.payload;
    let subject = &message.subject;

    if *subject == SUBMIT_SUBJECT {
        let result = match decode(payload) {
            Ok(operation) => handler.submit(operation).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(sender = %message.sender, "Submit failed: {}", e);
        }
        return reply(&result);
    }

    if *subject == PING_SUBJECT {
        let result = match decode(payload) {
            Ok(request) => handler.ping(request).await,
            Err(e) => Err(e.to_string()),
        };
        reply_logged(subject.as_str(), result)
    } else if *subject == SYNC_SUBJECT {
        let result = match decode(payload) {
            Ok(request) => handler.sync(request).await,
            Err(e) => Err(e.to_string()),
        };
        reply_logged(subject.as_str(), result)
    } else if *subject == POLL_SUBJECT {
        let result = match decode(payload) {
            Ok(request) => handler.poll(request).await,
            Err(e) => Err(e.to_string()),
        };
        reply_logged(subject.as_str(), result)
    } else {
        warn!(subject = %subject, "Unexpected subject on consensus server");
        None
    }
}

fn reply_logged<T: Serialize>(subject: &str, result: Reply<T>) -> Option<Bytes> {
    if let Err(e) = &result {
        warn!(subject, "Consensus request failed: {}", e);
    }
    reply(&result)
}

fn reply<T: Serialize>(value: &T) -> Option<Bytes> {
    encode(value)
        .map_err(|e| error!("Failed to encode consensus reply: {}", e))
        .ok()
}
