// Client request router
// Routes every table operation to the leader learned from leader-election
// broadcasts and maps the reply to a typed result.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raftable_api::{
    BatchReadRequest, BatchWriteRequest, DatabaseError, DatabaseService, ReadResult, Result,
    VersionedValue, WriteResult,
};
use raftable_cluster::{ClusterCommunicator, ClusterMessage, NodeId as MemberId, handler_fn};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::raft::engine::LeaderInfo;
use crate::raft::protocol::{LEADER_ELECTION_SUBJECT, LeaderAdvertisement, decode};
use crate::raft::request::{DatabaseOperation, DatabaseQuery, OperationResult, RaftRequest, RaftResponse};
use crate::raft::transport::ProtocolClientManager;

/// Routes operations to the current leader
pub struct DatabaseClient {
    communicator: Arc<dyn ClusterCommunicator>,
    clients: Arc<ProtocolClientManager>,
    leader_tx: watch::Sender<Option<LeaderInfo>>,
    poll_interval: Duration,
}

impl DatabaseClient {
    pub fn new(
        communicator: Arc<dyn ClusterCommunicator>,
        clients: Arc<ProtocolClientManager>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (leader_tx, _) = watch::channel(None);
        Arc::new(Self {
            communicator,
            clients,
            leader_tx,
            poll_interval,
        })
    }

    /// Start listening for leader advertisements
    pub fn start(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        self.communicator.add_subscriber(
            LEADER_ELECTION_SUBJECT,
            handler_fn(move |message: ClusterMessage| {
                let client = client.clone();
                async move {
                    match decode::<LeaderAdvertisement>(&message.payload) {
                        Ok(advertisement) => {
                            if let Some(client) = client.upgrade() {
                                client.observe_leader(advertisement);
                            }
                        }
                        Err(e) => warn!(sender = %message.sender, "Malformed leader advertisement: {}", e),
                    }
                    None
                }
            }),
        );
    }

    pub fn stop(&self) {
        self.communicator.remove_subscriber(&LEADER_ELECTION_SUBJECT);
    }

    /// Record an advertised leader unless a newer term is already known
    pub fn observe_leader(&self, advertisement: LeaderAdvertisement) {
        let LeaderAdvertisement { leader, term } = advertisement;
        self.leader_tx.send_if_modified(|current| match current {
            Some(known) if known.term > term => {
                trace!(stale = %leader, term, "Ignoring stale leader advertisement");
                false
            }
            Some(known) if known.leader == leader && known.term == term => false,
            _ => {
                info!(leader = %leader, term, "Leader elected");
                *current = Some(LeaderInfo { leader, term });
                true
            }
        });
    }

    pub fn current_leader(&self) -> Option<MemberId> {
        self.leader_tx.borrow().as_ref().map(|info| info.leader.clone())
    }

    pub fn leader_changes(&self) -> watch::Receiver<Option<LeaderInfo>> {
        self.leader_tx.subscribe()
    }

    /// Wait until a leader is known
    ///
    /// There is no upper bound; callers needing one wrap this in a timeout.
    pub async fn wait_for_leader(&self) -> MemberId {
        loop {
            if let Some(leader) = self.current_leader() {
                return leader;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Send an operation to the current leader
    pub async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult> {
        let leader = self.wait_for_leader().await;
        trace!(leader = %leader, op = operation.name(), "Submitting operation");
        let result = self.clients.client(&leader).submit(&operation).await;
        if let Err(e) = &result {
            debug!(leader = %leader, op = operation.name(), "Submit failed: {}", e);
        }
        result
    }

    async fn command(&self, request: RaftRequest) -> Result<RaftResponse> {
        let name = request.op_type();
        match self.submit(request.into()).await? {
            OperationResult::Command(response) => Ok(response),
            other => Err(unexpected_reply(name, &other)),
        }
    }

    async fn query(&self, query: DatabaseQuery) -> Result<OperationResult> {
        self.submit(query.into()).await
    }
}

fn unexpected_reply(operation: &str, reply: &impl std::fmt::Debug) -> DatabaseError {
    DatabaseError::IllegalState(format!("unexpected reply to {}: {:?}", operation, reply))
}

#[async_trait]
impl DatabaseService for DatabaseClient {
    async fn create_table(&self, name: &str) -> Result<bool> {
        match self
            .command(RaftRequest::CreateTable {
                name: name.to_string(),
                ttl_millis: None,
            })
            .await?
        {
            RaftResponse::TableCreated(created) => Ok(created),
            other => Err(unexpected_reply("createTable", &other)),
        }
    }

    async fn create_table_with_ttl(&self, name: &str, ttl_millis: u32) -> Result<bool> {
        match self
            .command(RaftRequest::CreateTable {
                name: name.to_string(),
                ttl_millis: Some(ttl_millis),
            })
            .await?
        {
            RaftResponse::TableCreated(created) => Ok(created),
            other => Err(unexpected_reply("createTable", &other)),
        }
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        match self
            .command(RaftRequest::DropTable {
                name: name.to_string(),
            })
            .await?
        {
            RaftResponse::TableDropped(_) => Ok(()),
            other => Err(unexpected_reply("dropTable", &other)),
        }
    }

    async fn drop_all_tables(&self) -> Result<()> {
        match self.command(RaftRequest::DropAllTables).await? {
            RaftResponse::AllTablesDropped(_) => Ok(()),
            other => Err(unexpected_reply("dropAllTables", &other)),
        }
    }

    async fn list_tables(&self) -> Result<BTreeSet<String>> {
        match self.query(DatabaseQuery::ListTables).await? {
            OperationResult::Tables(tables) => Ok(tables),
            other => Err(unexpected_reply("listTables", &other)),
        }
    }

    async fn batch_read(&self, batch: BatchReadRequest) -> Result<Vec<ReadResult>> {
        match self.query(DatabaseQuery::Read { batch }).await? {
            OperationResult::Read(results) => Ok(results),
            other => Err(unexpected_reply("read", &other)),
        }
    }

    async fn batch_write(&self, batch: BatchWriteRequest) -> Result<Vec<WriteResult>> {
        match self.command(RaftRequest::Write { batch }).await? {
            RaftResponse::Written(results) => Ok(results),
            other => Err(unexpected_reply("write", &other)),
        }
    }

    async fn get_all(&self, table: &str) -> Result<HashMap<String, VersionedValue>> {
        match self
            .query(DatabaseQuery::GetAll {
                table: table.to_string(),
            })
            .await?
        {
            OperationResult::Rows(rows) => Ok(rows),
            other => Err(unexpected_reply("getAll", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use openraft::raft::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
    use raftable_cluster::ControllerNode;
    use raftable_cluster::local::LocalClusterHub;

    use super::*;
    use crate::raft::protocol::{ProtocolHandler, Reply, SyncRequest, SyncResponse, encode};
    use crate::raft::server::RaftProtocolServer;
    use crate::raft::transport::ProtocolClientConfig;
    use crate::raft::types::{NodeId, TypeConfig};

    /// Answers listTables with its own name and counts submits
    struct NamedNode {
        name: &'static str,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolHandler for NamedNode {
        async fn ping(&self, _request: AppendEntriesRequest<TypeConfig>) -> Reply<AppendEntriesResponse<NodeId>> {
            Err("unused".to_string())
        }

        async fn sync(&self, _request: SyncRequest) -> Reply<SyncResponse> {
            Err("unused".to_string())
        }

        async fn poll(&self, _request: VoteRequest<NodeId>) -> Reply<VoteResponse<NodeId>> {
            Err("unused".to_string())
        }

        async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            match operation {
                DatabaseOperation::Query(DatabaseQuery::ListTables) => {
                    Ok(OperationResult::Tables([self.name.to_string()].into_iter().collect()))
                }
                DatabaseOperation::Command(RaftRequest::CreateTable { .. }) => {
                    Ok(OperationResult::Command(RaftResponse::TableCreated(true)))
                }
                _ => Err(DatabaseError::ConsensusUnavailable("not supported".to_string())),
            }
        }
    }

    fn serve(hub: &Arc<LocalClusterHub>, name: &'static str) -> Arc<NamedNode> {
        let communicator = hub.join(ControllerNode::new(name, "127.0.0.1", 1));
        let server = RaftProtocolServer::new(communicator, 4);
        let handler = Arc::new(NamedNode {
            name,
            submits: AtomicUsize::new(0),
        });
        server.register_handler(handler.clone());
        server.start();
        handler
    }

    fn router(hub: &Arc<LocalClusterHub>) -> (Arc<dyn ClusterCommunicator>, Arc<DatabaseClient>) {
        let communicator: Arc<dyn ClusterCommunicator> = hub.join(ControllerNode::new("client", "127.0.0.1", 9));
        let clients = Arc::new(ProtocolClientManager::new(
            Arc::clone(&communicator),
            ProtocolClientConfig::default(),
        ));
        let client = DatabaseClient::new(Arc::clone(&communicator), clients, Duration::from_millis(10));
        client.start();
        (communicator, client)
    }

    fn advertise(leader: &str, term: u64) -> LeaderAdvertisement {
        LeaderAdvertisement {
            leader: MemberId::from(leader),
            term,
        }
    }

    #[tokio::test]
    async fn test_submit_follows_leader_broadcasts() {
        let hub = LocalClusterHub::new();
        serve(&hub, "n1");
        serve(&hub, "n2");
        let (_communicator, client) = router(&hub);

        client.observe_leader(advertise("n1", 1));
        assert_eq!(client.list_tables().await.unwrap(), ["n1".to_string()].into_iter().collect());

        client.observe_leader(advertise("n2", 2));
        assert_eq!(client.list_tables().await.unwrap(), ["n2".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_stale_term_is_ignored() {
        let hub = LocalClusterHub::new();
        let (_communicator, client) = router(&hub);

        client.observe_leader(advertise("n2", 5));
        client.observe_leader(advertise("n1", 4));
        assert_eq!(client.current_leader(), Some(MemberId::from("n2")));
    }

    #[tokio::test]
    async fn test_broadcast_updates_leader() {
        let hub = LocalClusterHub::new();
        let (_communicator, client) = router(&hub);
        let leader = hub.join(ControllerNode::new("n3", "127.0.0.1", 3));

        leader
            .broadcast(LEADER_ELECTION_SUBJECT, encode(&advertise("n3", 1)).unwrap())
            .await
            .unwrap();
        let found = tokio::time::timeout(Duration::from_secs(1), client.wait_for_leader())
            .await
            .unwrap();
        assert_eq!(found, MemberId::from("n3"));
    }

    #[tokio::test]
    async fn test_wait_for_leader_blocks_until_known() {
        let hub = LocalClusterHub::new();
        let (_communicator, client) = router(&hub);

        let waited = tokio::time::timeout(Duration::from_millis(50), client.wait_for_leader()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_create_table_maps_reply() {
        let hub = LocalClusterHub::new();
        let node = serve(&hub, "n1");
        let (_communicator, client) = router(&hub);
        client.observe_leader(advertise("n1", 1));

        assert!(client.create_table("t").await.unwrap());
        assert!(matches!(
            client.drop_all_tables().await,
            Err(DatabaseError::ConsensusUnavailable(_))
        ));
        assert_eq!(node.submits.load(Ordering::SeqCst), 2);
    }
}
