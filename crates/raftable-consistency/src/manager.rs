// Database lifecycle
// Activation wires the log, state machine, consensus engine, transport, client
// router, TTL coordinator and lock service of one node; deactivation tears
// them down in reverse.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raftable_api::{
    BatchReadRequest, BatchWriteRequest, DatabaseError, DatabaseService, ReadResult, Result,
    VersionedValue, WriteResult,
};
use raftable_cluster::{ClusterCommunicator, ClusterMessage, ControllerNode, Membership, NodeId, handler_fn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::DatabaseClient;
use crate::lock::{DistributedLock, LockManager};
use crate::raft::config::RaftConfig;
use crate::raft::engine::{ConsensusEngine, RaftEngine};
use crate::raft::events::DatabaseEvent;
use crate::raft::protocol::{
    DATABASE_UPDATE_SUBJECT, DatabaseUpdate, LEADER_ELECTION_SUBJECT, LeaderAdvertisement, decode,
    encode,
};
use crate::raft::server::RaftProtocolServer;
use crate::raft::transport::{ProtocolClientConfig, ProtocolClientManager};
use crate::tablet::Tablet;
use crate::ttl::TtlCoordinator;

/// Components that only run on tablet members
struct MemberRuntime {
    server: Arc<RaftProtocolServer>,
    engine: Arc<RaftEngine>,
    ttl: Arc<TtlCoordinator>,
}

/// One node's view of the replicated database
pub struct DatabaseManager {
    local: NodeId,
    tablet: Tablet,
    communicator: Arc<dyn ClusterCommunicator>,
    membership: Arc<Membership>,
    clients: Arc<ProtocolClientManager>,
    client: Arc<DatabaseClient>,
    locks: Arc<LockManager>,
    member: Option<MemberRuntime>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DatabaseManager {
    /// Activate using the membership file named by `config`
    pub async fn activate(
        config: RaftConfig,
        communicator: Arc<dyn ClusterCommunicator>,
        membership: Arc<Membership>,
    ) -> Result<Arc<Self>> {
        let tablet = Tablet::load(config.member_file_path(), &config.tablet_name).await?;
        Self::activate_with_tablet(config, tablet, communicator, membership).await
    }

    pub async fn activate_with_tablet(
        config: RaftConfig,
        tablet: Tablet,
        communicator: Arc<dyn ClusterCommunicator>,
        membership: Arc<Membership>,
    ) -> Result<Arc<Self>> {
        let local = communicator.local_node().id.clone();
        info!(
            node_id = %local,
            tablet = %tablet.name,
            members = tablet.members.len(),
            "Activating database"
        );
        for node in &tablet.members {
            membership.add_node(node.clone());
        }

        let clients = Arc::new(ProtocolClientManager::new(
            communicator.clone(),
            ProtocolClientConfig {
                request_timeout: config.rpc_timeout(),
                pool_size: config.client_pool_size,
            },
        ));
        let client = DatabaseClient::new(
            communicator.clone(),
            clients.clone(),
            config.leader_poll_interval(),
        );
        client.start();

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let (member, lock_events) = if tablet.contains(&local) {
            let quorum = tablet.quorum();
            if !membership.wait_for_active(quorum, config.quorum_wait()).await {
                warn!(
                    quorum,
                    active = membership.active_nodes().len(),
                    "Quorum not visible after {:?}, starting anyway",
                    config.quorum_wait()
                );
            }

            let server = RaftProtocolServer::new(communicator.clone(), config.dispatch_workers);
            server.start();
            let engine = match RaftEngine::start(&config, local.clone(), clients.clone()).await {
                Ok(engine) => engine,
                Err(e) => {
                    server.stop();
                    client.stop();
                    return Err(e);
                }
            };
            server.register_handler(engine.clone());
            engine.initialize(&tablet.member_ids()).await?;

            tasks.push(tokio::spawn(advertise_leadership(
                engine.clone(),
                communicator.clone(),
                config.leader_advertise_delay(),
                config.leader_advertise_interval(),
                cancel.clone(),
            )));
            tasks.push(tokio::spawn(watch_log_size(
                engine.clone(),
                config.max_log_size_bytes,
                config.log_size_check_interval(),
                cancel.clone(),
            )));

            let ttl = TtlCoordinator::new(
                engine.clone() as Arc<dyn ConsensusEngine>,
                client.clone() as Arc<dyn DatabaseService>,
                communicator.clone(),
                config.ttl_housekeeping_interval(),
            );
            tasks.extend(ttl.start(engine.applied_events(), cancel.clone()));

            let lock_events = engine.applied_events();
            (Some(MemberRuntime { server, engine, ttl }), lock_events)
        } else {
            info!(node_id = %local, "Not a tablet member, running in client-only mode");
            (None, forward_remote_updates(communicator.as_ref()))
        };

        let locks = LockManager::new(
            client.clone() as Arc<dyn DatabaseService>,
            local.as_str(),
            config.activate_retry(),
        );
        tasks.push(locks.start(lock_events, cancel.clone()));

        let manager = Arc::new(Self {
            local,
            tablet,
            communicator,
            membership,
            clients,
            client,
            locks,
            member,
            cancel,
            tasks: Mutex::new(tasks),
        });
        manager
            .wait_until_ready(config.activate_max_retries, config.activate_retry(), config.rpc_timeout())
            .await;
        info!(node_id = %manager.local, "Database activated");
        Ok(manager)
    }

    /// Probe with `listTables` until a request succeeds
    async fn wait_until_ready(&self, attempts: u32, delay: Duration, timeout: Duration) -> bool {
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.client.list_tables()).await {
                Ok(Ok(_)) => {
                    debug!(attempt, "Database ready");
                    return true;
                }
                Ok(Err(e)) => debug!(attempt, "Readiness probe failed: {}", e),
                Err(_) => debug!(attempt, "Readiness probe timed out"),
            }
            tokio::time::sleep(delay).await;
        }
        warn!(attempts, "Database did not become ready");
        false
    }

    pub async fn deactivate(&self) {
        info!(node_id = %self.local, "Deactivating database");
        self.cancel.cancel();
        self.client.stop();

        match &self.member {
            Some(member) => {
                member.ttl.stop();
                member.server.stop();
                member.server.unregister_handler();
                if let Err(e) = member.engine.shutdown().await {
                    error!("Failed to shut down consensus engine: {}", e);
                }
            }
            None => self.communicator.remove_subscriber(&DATABASE_UPDATE_SUBJECT),
        }
        self.clients.close_all();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
        info!(node_id = %self.local, "Database deactivated");
    }

    pub fn local_member(&self) -> &NodeId {
        &self.local
    }

    pub fn tablet(&self) -> &Tablet {
        &self.tablet
    }

    /// Whether this node replicates the database
    pub fn is_member(&self) -> bool {
        self.member.is_some()
    }

    /// The consensus engine, on tablet members
    pub fn engine(&self) -> Option<&Arc<RaftEngine>> {
        self.member.as_ref().map(|m| &m.engine)
    }

    pub fn client(&self) -> &Arc<DatabaseClient> {
        &self.client
    }

    /// Leader as last advertised to this node
    pub fn leader(&self) -> Option<NodeId> {
        self.client.current_leader()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn create_lock(&self, path: impl Into<String>) -> DistributedLock {
        self.locks.create_lock(path)
    }

    /// Add `node` to the consensus configuration; must run on the leader
    pub async fn add_member(&self, node: ControllerNode) -> Result<()> {
        let engine = self.require_engine()?;
        self.membership.add_node(node.clone());
        engine.add_member(&node.id).await
    }

    /// Remove `id` from the consensus configuration; must run on the leader
    pub async fn remove_member(&self, id: &NodeId) -> Result<()> {
        self.require_engine()?.remove_member(id).await
    }

    pub fn list_members(&self) -> Vec<NodeId> {
        match &self.member {
            Some(member) => member.engine.members(),
            None => self.tablet.member_ids(),
        }
    }

    fn require_engine(&self) -> Result<&Arc<RaftEngine>> {
        self.engine().ok_or_else(|| {
            DatabaseError::IllegalState(format!("{} is not a member of the tablet", self.local))
        })
    }
}

/// Periodically tell every node who leads while this node does
async fn advertise_leadership(
    engine: Arc<RaftEngine>,
    communicator: Arc<dyn ClusterCommunicator>,
    delay: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut leader_changes = engine.leader_changes();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            changed = leader_changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(info) = leader_changes.borrow_and_update().clone() else {
            continue;
        };
        if &info.leader != engine.local_member() {
            continue;
        }
        let advertisement = LeaderAdvertisement {
            leader: info.leader,
            term: info.term,
        };
        match encode(&advertisement) {
            Ok(payload) => {
                if let Err(e) = communicator
                    .broadcast_include_self(LEADER_ELECTION_SUBJECT, payload)
                    .await
                {
                    debug!("Failed to advertise leadership: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode leader advertisement: {}", e),
        }
    }
    debug!("Leader advertiser stopped");
}

/// Snapshot once the persistent log outgrows `max_bytes`
async fn watch_log_size(
    engine: Arc<RaftEngine>,
    max_bytes: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match engine.log_size() {
                    Ok(size) if size > max_bytes => {
                        info!(size, max_bytes, "Log size limit exceeded, taking snapshot");
                        if let Err(e) = engine.trigger_snapshot().await {
                            warn!("Failed to trigger snapshot: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to read log size: {}", e),
                }
            }
        }
    }
}

/// Client-only nodes learn about deleted rows from the leader's broadcasts
fn forward_remote_updates(
    communicator: &dyn ClusterCommunicator,
) -> mpsc::UnboundedReceiver<DatabaseEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    communicator.add_subscriber(
        DATABASE_UPDATE_SUBJECT,
        handler_fn(move |message: ClusterMessage| {
            let tx = tx.clone();
            async move {
                match decode::<DatabaseUpdate>(&message.payload) {
                    Ok(update) => {
                        let _ = tx.send(DatabaseEvent::TableModified(update.event));
                    }
                    Err(e) => warn!(sender = %message.sender, "Malformed database update: {}", e),
                }
                None
            }
        }),
    );
    rx
}

#[async_trait]
impl DatabaseService for DatabaseManager {
    async fn create_table(&self, name: &str) -> Result<bool> {
        self.client.create_table(name).await
    }

    async fn create_table_with_ttl(&self, name: &str, ttl_millis: u32) -> Result<bool> {
        self.client.create_table_with_ttl(name, ttl_millis).await
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        self.client.drop_table(name).await
    }

    async fn drop_all_tables(&self) -> Result<()> {
        self.client.drop_all_tables().await
    }

    async fn list_tables(&self) -> Result<BTreeSet<String>> {
        self.client.list_tables().await
    }

    async fn batch_read(&self, batch: BatchReadRequest) -> Result<Vec<ReadResult>> {
        self.client.batch_read(batch).await
    }

    async fn batch_write(&self, batch: BatchWriteRequest) -> Result<Vec<WriteResult>> {
        self.client.batch_write(batch).await
    }

    async fn get_all(&self, table: &str) -> Result<HashMap<String, VersionedValue>> {
        self.client.get_all(table).await
    }
}
