// Client side of the consensus transport
// Sends consensus RPCs to one member over cluster messaging, with a fixed
// reply timeout and edge-triggered connectivity logging.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use openraft::raft::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use parking_lot::Mutex;
use raftable_api::DatabaseError;
use raftable_cluster::{ClusterCommunicator, MessageSubject, MessagingError, NodeId as MemberId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use super::protocol::{
    POLL_SUBJECT, PING_SUBJECT, Reply, SUBMIT_SUBJECT, SYNC_SUBJECT, SyncRequest, SyncResponse,
    decode, encode,
};
use super::request::{DatabaseOperation, OperationResult};
use super::types::{NodeId, TypeConfig};

/// Settings shared by every protocol client of a node
#[derive(Debug, Clone)]
pub struct ProtocolClientConfig {
    pub request_timeout: Duration,
    /// Concurrent in-flight requests per client
    pub pool_size: usize,
}

impl Default for ProtocolClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(2000),
            pool_size: 8,
        }
    }
}

/// Consensus RPC client bound to one member
pub struct ProtocolClient {
    communicator: Arc<dyn ClusterCommunicator>,
    target: MemberId,
    config: ProtocolClientConfig,
    /// Created by `connect()`, dropped by `close()`
    pool: Mutex<Option<Arc<Semaphore>>>,
    healthy: AtomicBool,
}

impl ProtocolClient {
    pub fn new(
        communicator: Arc<dyn ClusterCommunicator>,
        target: MemberId,
        config: ProtocolClientConfig,
    ) -> Self {
        Self {
            communicator,
            target,
            config,
            pool: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn target(&self) -> &MemberId {
        &self.target
    }

    /// Create the request pool if it is not there yet
    pub fn connect(&self) -> Arc<Semaphore> {
        let mut pool = self.pool.lock();
        match pool.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                debug!(target_node = %self.target, "Opening protocol client");
                let created = Arc::new(Semaphore::new(self.config.pool_size.max(1)));
                *pool = Some(Arc::clone(&created));
                created
            }
        }
    }

    /// Drop the request pool; the next request reconnects
    pub fn close(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.close();
            debug!(target_node = %self.target, "Closed protocol client");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn ping(
        &self,
        request: &AppendEntriesRequest<TypeConfig>,
    ) -> Result<Reply<AppendEntriesResponse<NodeId>>, DatabaseError> {
        self.request(PING_SUBJECT, request).await
    }

    pub async fn sync(&self, request: &SyncRequest) -> Result<Reply<SyncResponse>, DatabaseError> {
        self.request(SYNC_SUBJECT, request).await
    }

    pub async fn poll(&self, request: &VoteRequest<NodeId>) -> Result<Reply<VoteResponse<NodeId>>, DatabaseError> {
        self.request(POLL_SUBJECT, request).await
    }

    pub async fn submit(&self, operation: &DatabaseOperation) -> Result<OperationResult, DatabaseError> {
        let reply: Result<OperationResult, DatabaseError> = self.request(SUBMIT_SUBJECT, operation).await?;
        reply
    }

    async fn request<Req, Resp>(&self, subject: MessageSubject, request: &Req) -> Result<Resp, DatabaseError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(request)?;
        let pool = self.connect();
        let _permit = match pool.acquire_owned().await {
            Ok(permit) => permit,
            // closed while waiting; reconnect once
            Err(_) => self
                .connect()
                .acquire_owned()
                .await
                .map_err(|_| DatabaseError::Messaging(format!("client for {} closed", self.target)))?,
        };

        let sent = tokio::time::timeout(
            self.config.request_timeout,
            self.communicator
                .send_and_receive(subject.clone(), payload, &self.target),
        )
        .await;

        match sent {
            Ok(Ok(bytes)) => {
                self.mark_healthy();
                decode(&bytes)
            }
            Ok(Err(e)) => {
                self.mark_unhealthy(&subject, &e.to_string());
                Err(match e {
                    MessagingError::NoResponse(node) => {
                        DatabaseError::Timeout(format!("{} unanswered by {}", subject, node))
                    }
                    other => DatabaseError::Messaging(other.to_string()),
                })
            }
            Err(_) => {
                self.mark_unhealthy(&subject, "timed out");
                Err(DatabaseError::Timeout(format!(
                    "{} to {} after {:?}",
                    subject, self.target, self.config.request_timeout
                )))
            }
        }
    }

    fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!(target_node = %self.target, "Connection restored");
        }
    }

    fn mark_unhealthy(&self, subject: &MessageSubject, reason: &str) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!(target_node = %self.target, subject = %subject, "Connection lost: {}", reason);
        } else {
            trace!(target_node = %self.target, subject = %subject, "Request failed: {}", reason);
        }
    }
}

/// Protocol clients cached per member
pub struct ProtocolClientManager {
    communicator: Arc<dyn ClusterCommunicator>,
    config: ProtocolClientConfig,
    clients: DashMap<MemberId, Arc<ProtocolClient>>,
}

impl ProtocolClientManager {
    pub fn new(communicator: Arc<dyn ClusterCommunicator>, config: ProtocolClientConfig) -> Self {
        Self {
            communicator,
            config,
            clients: DashMap::new(),
        }
    }

    pub fn local_member(&self) -> &MemberId {
        &self.communicator.local_node().id
    }

    /// Get or create the client for `target`
    pub fn client(&self, target: &MemberId) -> Arc<ProtocolClient> {
        self.clients
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(ProtocolClient::new(
                    Arc::clone(&self.communicator),
                    target.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Close and forget every client
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
        info!("Closed all protocol clients");
    }
}
