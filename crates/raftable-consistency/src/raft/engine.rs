// Consensus engine port and its openraft implementation
// The rest of the crate only sees ConsensusEngine: submit operations, observe
// leadership and subscribe to applied events.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::error::{InitializeError, RaftError};
use openraft::raft::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use openraft::{BasicNode, ServerState, Snapshot};
use raftable_api::DatabaseError;
use raftable_cluster::NodeId as MemberId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::events::DatabaseEvent;
use super::log::ConsensusLog;
use super::log_store::RaftLogStore;
use super::network::RaftableNetworkFactory;
use super::protocol::{ProtocolHandler, Reply, SyncRequest, SyncResponse};
use super::request::{DatabaseOperation, OperationResult, RaftRequest};
use super::state_machine::DatabaseStateMachine;
use super::transport::ProtocolClientManager;
use super::types::{NodeId, Raft, RaftMetrics, TypeConfig, basic_node, calculate_node_id};

/// The elected leader and the term it was elected in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub leader: MemberId,
    pub term: u64,
}

/// Narrow view of a consensus implementation
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn local_member(&self) -> &MemberId;

    /// Replicate a command, or answer a query from local state
    async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult, DatabaseError>;

    /// The leader as known to this node's engine
    fn current_leader(&self) -> Option<MemberId>;

    fn leader_changes(&self) -> watch::Receiver<Option<LeaderInfo>>;

    /// Events of every entry applied from now on, in apply order
    fn applied_events(&self) -> mpsc::UnboundedReceiver<DatabaseEvent>;

    async fn shutdown(&self) -> Result<(), DatabaseError>;

    fn is_leader(&self) -> bool {
        self.current_leader().as_ref() == Some(self.local_member())
    }
}

fn unavailable(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::ConsensusUnavailable(e.to_string())
}

/// openraft-backed consensus engine
pub struct RaftEngine {
    node_id: NodeId,
    member_id: MemberId,
    raft: Raft,
    state_machine: DatabaseStateMachine,
    log: Arc<ConsensusLog>,
    leader_rx: watch::Receiver<Option<LeaderInfo>>,
    monitor: JoinHandle<()>,
}

impl RaftEngine {
    /// Open the log and state machine of `member_id` and start the engine
    pub async fn start(
        config: &RaftConfig,
        member_id: MemberId,
        clients: Arc<ProtocolClientManager>,
    ) -> Result<Arc<Self>, DatabaseError> {
        let node_id = calculate_node_id(member_id.as_str());
        info!(
            "Creating Raft engine: id={}, member={}, data_dir={:?}",
            node_id, member_id, config.data_dir
        );

        config
            .ensure_dirs(member_id.as_str())
            .map_err(|e| DatabaseError::Storage(e.to_string()))?;

        let log_store = RaftLogStore::open(config.log_dir(member_id.as_str()))
            .map_err(|e| DatabaseError::Storage(e.to_string()))?;
        let log = Arc::clone(log_store.log());
        let state_machine =
            DatabaseStateMachine::open(config.snapshot_dir(member_id.as_str()), config.compress_snapshots)
                .await
                .map_err(|e| DatabaseError::Storage(e.to_string()))?;

        let raft_config = config
            .to_openraft_config()
            .map_err(|e| DatabaseError::IllegalState(e.to_string()))?;
        let raft = Raft::new(
            node_id,
            Arc::new(raft_config),
            RaftableNetworkFactory::new(clients),
            log_store,
            state_machine.clone(),
        )
        .await
        .map_err(unavailable)?;

        let (leader_tx, leader_rx) = watch::channel(None);
        let monitor = tokio::spawn(monitor_leadership(raft.metrics(), leader_tx));

        info!("Raft engine created successfully: id={}", node_id);
        Ok(Arc::new(Self {
            node_id,
            member_id,
            raft,
            state_machine,
            log,
            leader_rx,
            monitor,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn current_term(&self) -> u64 {
        self.metrics().current_term
    }

    pub fn state(&self) -> ServerState {
        self.metrics().state
    }

    /// Bytes currently held by the persistent log
    pub fn log_size(&self) -> Result<u64, DatabaseError> {
        Ok(self.log.size()?)
    }

    /// Initialize the cluster with every member of the tablet
    ///
    /// Each member calls this with the same set; a node that is already
    /// initialized treats it as a no-op.
    pub async fn initialize(&self, members: &[MemberId]) -> Result<(), DatabaseError> {
        let nodes: BTreeMap<NodeId, BasicNode> = members
            .iter()
            .map(|m| (calculate_node_id(m.as_str()), basic_node(m.as_str())))
            .collect();
        info!("Initializing Raft cluster with {} members", nodes.len());

        match self.raft.initialize(nodes).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                debug!("Raft cluster already initialized: {}", e);
                Ok(())
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Add a member as learner, then promote it to voter
    pub async fn add_member(&self, member: &MemberId) -> Result<(), DatabaseError> {
        let node_id = calculate_node_id(member.as_str());
        info!("Adding member: id={}, member={}", node_id, member);

        self.raft
            .add_learner(node_id, basic_node(member.as_str()), true)
            .await
            .map_err(unavailable)?;

        let mut voters = self.voter_ids();
        voters.insert(node_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    pub async fn remove_member(&self, member: &MemberId) -> Result<(), DatabaseError> {
        let node_id = calculate_node_id(member.as_str());
        info!("Removing member: id={}, member={}", node_id, member);

        let mut voters = self.voter_ids();
        if !voters.remove(&node_id) {
            return Ok(());
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Members of the current consensus configuration
    pub fn members(&self) -> Vec<MemberId> {
        let metrics = self.metrics();
        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(_, node)| MemberId::from(node.addr.as_str()))
            .collect()
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.metrics()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// Take a snapshot now, which also purges the log behind it
    pub async fn trigger_snapshot(&self) -> Result<(), DatabaseError> {
        self.raft.trigger().snapshot().await.map_err(unavailable)
    }

    async fn write(&self, request: RaftRequest) -> Result<OperationResult, DatabaseError> {
        debug!("Writing through Raft: {}", request.op_type());
        let response = self.raft.client_write(request).await.map_err(|e| {
            debug!("Client write rejected: {}", e);
            unavailable(e)
        })?;
        Ok(OperationResult::Command(response.data))
    }
}

/// Publish the leader whenever openraft's view of it changes
async fn monitor_leadership(
    mut metrics: watch::Receiver<RaftMetrics>,
    leader_tx: watch::Sender<Option<LeaderInfo>>,
) {
    loop {
        let leader = {
            let m = metrics.borrow_and_update();
            m.current_leader.and_then(|id| {
                m.membership_config
                    .membership()
                    .get_node(&id)
                    .map(|node| LeaderInfo {
                        leader: MemberId::from(node.addr.as_str()),
                        term: m.current_term,
                    })
            })
        };
        leader_tx.send_if_modified(|current| {
            if *current != leader {
                if let Some(info) = &leader {
                    info!(leader = %info.leader, term = info.term, "Leader changed");
                }
                *current = leader;
                true
            } else {
                false
            }
        });

        if metrics.changed().await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    fn local_member(&self) -> &MemberId {
        &self.member_id
    }

    async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult, DatabaseError> {
        match operation {
            DatabaseOperation::Command(request) => self.write(request).await,
            DatabaseOperation::Query(query) => Ok(self.state_machine.query(&query)),
        }
    }

    fn current_leader(&self) -> Option<MemberId> {
        self.leader_rx.borrow().as_ref().map(|info| info.leader.clone())
    }

    fn leader_changes(&self) -> watch::Receiver<Option<LeaderInfo>> {
        self.leader_rx.clone()
    }

    fn applied_events(&self) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        self.state_machine.subscribe()
    }

    async fn shutdown(&self) -> Result<(), DatabaseError> {
        info!("Shutting down Raft engine: id={}", self.node_id);
        self.monitor.abort();
        if let Err(e) = self.raft.shutdown().await {
            warn!("Raft engine did not shut down cleanly: {}", e);
        }
        info!("Raft engine shutdown complete");
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for RaftEngine {
    async fn ping(&self, request: AppendEntriesRequest<TypeConfig>) -> Reply<AppendEntriesResponse<NodeId>> {
        self.raft.append_entries(request).await.map_err(|e| e.to_string())
    }

    async fn sync(&self, request: SyncRequest) -> Reply<SyncResponse> {
        match request {
            SyncRequest::Append(request) => self
                .raft
                .append_entries(request)
                .await
                .map(SyncResponse::Append)
                .map_err(|e| e.to_string()),
            SyncRequest::InstallSnapshot(request) => self
                .raft
                .install_snapshot(request)
                .await
                .map(SyncResponse::InstallSnapshot)
                .map_err(|e| e.to_string()),
            SyncRequest::FullSnapshot { vote, meta, data } => {
                let snapshot = Snapshot {
                    meta,
                    snapshot: Box::new(Cursor::new(data)),
                };
                self.raft
                    .install_full_snapshot(vote, snapshot)
                    .await
                    .map(SyncResponse::FullSnapshot)
                    .map_err(|e| e.to_string())
            }
        }
    }

    async fn poll(&self, request: VoteRequest<NodeId>) -> Reply<VoteResponse<NodeId>> {
        self.raft.vote(request).await.map_err(|e| e.to_string())
    }

    async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult, DatabaseError> {
        ConsensusEngine::submit(self, operation).await
    }
}
