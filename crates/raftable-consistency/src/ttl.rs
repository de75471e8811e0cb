// TTL expiration coordinator
// Mirrors the rows of every TTL table in expiring caches on every node. When a
// mirror entry expires, the leader removes the row if its version is unchanged;
// other nodes re-arm the entry in case they become leader.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use raftable_api::{
    DatabaseError, DatabaseService, TableMetadata, TableModificationEvent, TableModificationType,
};
use raftable_cluster::{ClusterCommunicator, ClusterMessage, handler_fn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::raft::engine::ConsensusEngine;
use crate::raft::events::DatabaseEvent;
use crate::raft::protocol::{DATABASE_UPDATE_SUBJECT, DatabaseUpdate, decode, encode};
use crate::raft::state::DatabaseState;

/// key -> version; the cell is updated in place so updates keep the original expiry
type Mirror = Cache<String, Arc<AtomicU64>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpiredRow {
    table: String,
    key: String,
    version: u64,
}

pub struct TtlCoordinator {
    engine: Arc<dyn ConsensusEngine>,
    database: Arc<dyn DatabaseService>,
    communicator: Arc<dyn ClusterCommunicator>,
    mirrors: DashMap<String, Mirror>,
    expired_tx: mpsc::UnboundedSender<ExpiredRow>,
    expired_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ExpiredRow>>>,
    housekeeping_interval: Duration,
}

impl TtlCoordinator {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        database: Arc<dyn DatabaseService>,
        communicator: Arc<dyn ClusterCommunicator>,
        housekeeping_interval: Duration,
    ) -> Arc<Self> {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            engine,
            database,
            communicator,
            mirrors: DashMap::new(),
            expired_tx,
            expired_rx: parking_lot::Mutex::new(Some(expired_rx)),
            housekeeping_interval,
        })
    }

    /// Start consuming `events` until `cancel` fires
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<DatabaseEvent>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let coordinator = Arc::downgrade(self);
        self.communicator.add_subscriber(
            DATABASE_UPDATE_SUBJECT,
            handler_fn(move |message: ClusterMessage| {
                let coordinator = coordinator.clone();
                async move {
                    match decode::<DatabaseUpdate>(&message.payload) {
                        Ok(update) => {
                            if let Some(coordinator) = coordinator.upgrade() {
                                coordinator.on_remote_update(update.event);
                            }
                        }
                        Err(e) => warn!(sender = %message.sender, "Malformed database update: {}", e),
                    }
                    None
                }
            }),
        );

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).event_loop(events, cancel.clone())),
            tokio::spawn(Arc::clone(self).housekeeping_loop(cancel.clone())),
        ];
        if let Some(expired) = self.expired_rx.lock().take() {
            tasks.push(tokio::spawn(Arc::clone(self).expiry_loop(expired, cancel)));
        }
        info!(
            interval_ms = self.housekeeping_interval.as_millis() as u64,
            "TTL coordinator started"
        );
        tasks
    }

    pub fn stop(&self) {
        self.communicator.remove_subscriber(&DATABASE_UPDATE_SUBJECT);
        self.mirrors.clear();
    }

    /// Tables currently mirrored
    pub fn mirrored_tables(&self) -> Vec<String> {
        self.mirrors.iter().map(|e| e.key().clone()).collect()
    }

    /// Version mirrored for `key`, if it is awaiting expiry
    pub fn mirrored_version(&self, table: &str, key: &str) -> Option<u64> {
        let mirror = self.mirrors.get(table)?;
        mirror.get(key).map(|cell| cell.load(Ordering::Acquire))
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DatabaseEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
            }
        }
        debug!("TTL event loop stopped");
    }

    async fn housekeeping_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.housekeeping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for entry in self.mirrors.iter() {
                        entry.value().run_pending_tasks();
                    }
                }
            }
        }
        debug!("TTL housekeeping stopped");
    }

    async fn expiry_loop(self: Arc<Self>, mut expired: mpsc::UnboundedReceiver<ExpiredRow>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                row = expired.recv() => match row {
                    Some(row) => self.on_expired(row).await,
                    None => break,
                },
            }
        }
        debug!("TTL expiry loop stopped");
    }

    async fn on_event(&self, event: DatabaseEvent) {
        match event {
            DatabaseEvent::TableCreated(metadata) => self.add_mirror(&metadata),
            DatabaseEvent::TableDropped(name) => {
                if let Some((_, mirror)) = self.mirrors.remove(&name) {
                    mirror.invalidate_all();
                    debug!(table = %name, "Dropped TTL mirror");
                }
            }
            DatabaseEvent::TableModified(event) => {
                let deleted = event.kind == TableModificationType::RowDeleted;
                self.apply_modification(&event);
                if deleted && self.engine.is_leader() {
                    self.broadcast_deletion(event).await;
                }
            }
            DatabaseEvent::SnapshotInstalled(state) => self.rebuild(&state),
        }
    }

    fn add_mirror(&self, metadata: &TableMetadata) {
        let Some(ttl_millis) = metadata.ttl_millis.filter(|_| metadata.has_ttl()) else {
            return;
        };
        let ttl = Duration::from_millis(u64::from(ttl_millis));
        let table = metadata.name.clone();
        let expired_tx = self.expired_tx.clone();

        let mirror: Mirror = Cache::builder()
            .time_to_live(ttl)
            .eviction_listener(move |key: Arc<String>, version: Arc<AtomicU64>, cause| {
                if cause == RemovalCause::Expired {
                    let _ = expired_tx.send(ExpiredRow {
                        table: table.clone(),
                        key: key.as_ref().clone(),
                        version: version.load(Ordering::Acquire),
                    });
                }
            })
            .build();
        self.mirrors.insert(metadata.name.clone(), mirror);
        debug!(table = %metadata.name, ttl_ms = ttl_millis, "Created TTL mirror");
    }

    fn apply_modification(&self, event: &TableModificationEvent) {
        let Some(entry) = self.mirrors.get(&event.table_name) else {
            return;
        };
        let mirror = entry.value();
        let version = event.value.version;

        match event.kind {
            TableModificationType::RowAdded => {
                mirror.insert(event.key.clone(), Arc::new(AtomicU64::new(version)));
            }
            TableModificationType::RowUpdated => match mirror.get(&event.key) {
                Some(cell) => cell.store(version, Ordering::Release),
                None => mirror.insert(event.key.clone(), Arc::new(AtomicU64::new(version))),
            },
            TableModificationType::RowDeleted => mirror.invalidate(&event.key),
        }
        trace!(table = %event.table_name, key = %event.key, version, kind = ?event.kind, "Mirrored row change");
    }

    /// Deletions broadcast by the leader
    fn on_remote_update(&self, event: TableModificationEvent) {
        if event.kind != TableModificationType::RowDeleted {
            return;
        }
        if let Some(entry) = self.mirrors.get(&event.table_name) {
            entry.value().invalidate(&event.key);
        }
    }

    async fn broadcast_deletion(&self, event: TableModificationEvent) {
        let payload = match encode(&DatabaseUpdate { event }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode database update: {}", e);
                return;
            }
        };
        if let Err(e) = self.communicator.broadcast(DATABASE_UPDATE_SUBJECT, payload).await {
            debug!("Failed to broadcast database update: {}", e);
        }
    }

    /// Replace every mirror with the rows of `state`
    fn rebuild(&self, state: &DatabaseState) {
        for entry in self.mirrors.iter() {
            entry.value().invalidate_all();
        }
        self.mirrors.clear();

        for table in state.tables() {
            self.add_mirror(&table.metadata);
            if let Some(entry) = self.mirrors.get(&table.metadata.name) {
                for (key, value) in &table.entries {
                    entry
                        .value()
                        .insert(key.clone(), Arc::new(AtomicU64::new(value.version)));
                }
            }
        }
        info!(tables = self.mirrors.len(), "Rebuilt TTL mirrors from snapshot");
    }

    async fn on_expired(&self, row: ExpiredRow) {
        if !self.mirrors.contains_key(&row.table) {
            return;
        }
        if !self.engine.is_leader() {
            self.rearm(&row);
            return;
        }

        match self
            .database
            .remove_if_version_matches(&row.table, &row.key, row.version)
            .await
        {
            Ok(true) => debug!(table = %row.table, key = %row.key, version = row.version, "Expired row removed"),
            Ok(false) => debug!(
                table = %row.table,
                key = %row.key,
                version = row.version,
                "Row changed before expiry, skipped"
            ),
            Err(DatabaseError::UnexpectedStatus { status, .. }) => {
                debug!(table = %row.table, key = %row.key, "Expiry skipped: {}", status)
            }
            Err(e) => {
                warn!(table = %row.table, key = %row.key, "Failed to remove expired row: {}", e);
                self.rearm(&row);
            }
        }
    }

    /// Keep the row as a candidate; a newer mirror entry wins
    fn rearm(&self, row: &ExpiredRow) {
        if let Some(entry) = self.mirrors.get(&row.table) {
            entry
                .value()
                .get_with(row.key.clone(), || Arc::new(AtomicU64::new(row.version)));
            trace!(table = %row.table, key = %row.key, "Re-armed expiry candidate");
        }
    }
}
