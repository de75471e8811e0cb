// Membership liveness heartbeat
// Every node broadcasts an empty message on a fixed subject; receiving one marks
// the sender active, and members silent for three intervals are marked inactive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::communicator::{ClusterCommunicator, ClusterMessageHandler};
use crate::membership::Membership;
use crate::message::{ClusterMessage, MessageSubject};

pub const HEARTBEAT_SUBJECT: MessageSubject = MessageSubject::from_static("cluster-heartbeat");

struct HeartbeatHandler {
    membership: Arc<Membership>,
}

#[async_trait]
impl ClusterMessageHandler for HeartbeatHandler {
    async fn handle(&self, message: ClusterMessage) -> Option<Bytes> {
        trace!(sender = %message.sender, "Heartbeat received");
        self.membership.mark_active(&message.sender);
        None
    }
}

/// Registers the heartbeat subscriber and spawns the sender/sweeper task.
pub fn start_heartbeat(
    membership: Arc<Membership>,
    communicator: Arc<dyn ClusterCommunicator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    communicator.add_subscriber(
        HEARTBEAT_SUBJECT,
        Arc::new(HeartbeatHandler {
            membership: membership.clone(),
        }),
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = communicator.broadcast(HEARTBEAT_SUBJECT, Bytes::new()).await {
                        debug!(error = %e, "Heartbeat broadcast failed");
                    }
                    membership.sweep(interval * 3);
                }
            }
        }
        communicator.remove_subscriber(&HEARTBEAT_SUBJECT);
        debug!("Heartbeat task stopped");
    })
}
