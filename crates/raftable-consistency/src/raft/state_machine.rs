// Raft state machine implementation
// Applies committed log entries to the in-memory database state and keeps the
// latest snapshot on disk so a restarted node resumes from it.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, ErrorSubject, ErrorVerb, OptionalSend, StorageError};
use parking_lot::RwLock;
use raftable_api::DatabaseError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::events::{DatabaseEvent, DatabaseEventPublisher};
use super::request::{DatabaseQuery, OperationResult, RaftResponse};
use super::state::{DatabaseState, decode_snapshot, encode_snapshot};
use super::types::{Entry, LogId, NodeId, SnapshotMeta, StoredMembership, TypeConfig};

// Snapshot files inside the snapshot directory
const SNAPSHOT_META_FILE: &str = "current.meta";
const SNAPSHOT_DATA_FILE: &str = "current.data";

/// Helper to create StorageError for state machine operations
fn sm_error(e: impl std::error::Error, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Snapshot failures are fatal to the node, so they are always logged loudly
fn snapshot_error(e: DatabaseError, verb: ErrorVerb) -> StorageError<NodeId> {
    error!("Snapshot failure: {}", e);
    sm_error(e, verb)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta,
    #[serde(skip)]
    data: Vec<u8>,
}

#[derive(Default)]
struct AppliedState {
    last_applied: Option<LogId>,
    last_membership: StoredMembership,
}

struct Inner {
    state: RwLock<DatabaseState>,
    applied: RwLock<AppliedState>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    publisher: DatabaseEventPublisher,
    snapshot_dir: PathBuf,
    compress: bool,
}

/// openraft state machine over [`DatabaseState`]
///
/// Cheap to clone; clones share state so queries can be answered while
/// openraft owns the instance it applies entries through.
#[derive(Clone)]
pub struct DatabaseStateMachine {
    inner: Arc<Inner>,
}

impl DatabaseStateMachine {
    /// Open the state machine, restoring the snapshot persisted in `snapshot_dir`
    pub async fn open<P: AsRef<Path>>(snapshot_dir: P, compress: bool) -> Result<Self, StorageError<NodeId>> {
        let snapshot_dir = snapshot_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        let sm = Self {
            inner: Arc::new(Inner {
                state: RwLock::new(DatabaseState::new()),
                applied: RwLock::new(AppliedState::default()),
                snapshot: RwLock::new(None),
                publisher: DatabaseEventPublisher::new(),
                snapshot_dir,
                compress,
            }),
        };

        if let Some(stored) = sm.load_snapshot().await? {
            let state = decode_snapshot(&stored.data).map_err(|e| snapshot_error(e, ErrorVerb::Read))?;
            *sm.inner.state.write() = state;
            {
                let mut applied = sm.inner.applied.write();
                applied.last_applied = stored.meta.last_log_id;
                applied.last_membership = stored.meta.last_membership.clone();
            }
            info!("Restored snapshot {}", stored.meta.snapshot_id);
            *sm.inner.snapshot.write() = Some(stored);
        }

        info!(dir = %sm.inner.snapshot_dir.display(), "Database state machine initialized");
        Ok(sm)
    }

    /// Subscribe to applied events
    ///
    /// A non-empty state is delivered first as a `SnapshotInstalled` event so
    /// subscribers start from what is already applied.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        // held so no apply slips between the copy and the subscription
        let state = self.inner.state.read();
        let initial = (state.tables().next().is_some())
            .then(|| DatabaseEvent::SnapshotInstalled(Arc::new(state.clone())));
        self.inner.publisher.subscribe_with(initial)
    }

    /// Answer a query from local, possibly stale, state
    pub fn query(&self, query: &DatabaseQuery) -> OperationResult {
        self.inner.state.read().query(query)
    }

    pub fn last_applied(&self) -> Option<LogId> {
        self.inner.applied.read().last_applied
    }

    async fn load_snapshot(&self) -> Result<Option<StoredSnapshot>, StorageError<NodeId>> {
        let meta_path = self.inner.snapshot_dir.join(SNAPSHOT_META_FILE);
        if !tokio::fs::try_exists(&meta_path)
            .await
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            return Ok(None);
        }

        let meta_bytes = tokio::fs::read(&meta_path)
            .await
            .map_err(|e| sm_error(e, ErrorVerb::Read))?;
        let mut stored: StoredSnapshot =
            serde_json::from_slice(&meta_bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
        stored.data = tokio::fs::read(self.inner.snapshot_dir.join(SNAPSHOT_DATA_FILE))
            .await
            .map_err(|e| sm_error(e, ErrorVerb::Read))?;
        Ok(Some(stored))
    }

    /// Write data then meta, each through a temp file and rename
    async fn persist_snapshot(&self, stored: &StoredSnapshot) -> Result<(), StorageError<NodeId>> {
        let meta_bytes = serde_json::to_vec(stored).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        for (name, bytes) in [
            (SNAPSHOT_DATA_FILE, stored.data.as_slice()),
            (SNAPSHOT_META_FILE, meta_bytes.as_slice()),
        ] {
            let path = self.inner.snapshot_dir.join(name);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, bytes)
                .await
                .map_err(|e| sm_error(e, ErrorVerb::Write))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| sm_error(e, ErrorVerb::Write))?;
        }
        Ok(())
    }

    fn apply_entries(&self, entries: Vec<Entry>) -> Vec<RaftResponse> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut events = Vec::new();
        let mut state = self.inner.state.write();

        for entry in entries {
            let log_id = entry.log_id;
            let response = match entry.payload {
                EntryPayload::Normal(request) => {
                    debug!(index = log_id.index, op = request.op_type(), "Applying command");
                    state.apply(&request, &mut events)
                }
                EntryPayload::Membership(membership) => {
                    self.inner.applied.write().last_membership =
                        StoredMembership::new(Some(log_id), membership);
                    RaftResponse::Empty
                }
                EntryPayload::Blank => RaftResponse::Empty,
            };
            self.inner.applied.write().last_applied = Some(log_id);
            metrics::gauge!("raftable_applied_index").set(log_id.index as f64);
            responses.push(response);
        }

        // published under the write lock so subscribe() never misses or repeats an event
        self.inner.publisher.publish_all(events);
        responses
    }
}

impl RaftSnapshotBuilder<TypeConfig> for DatabaseStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (data, last_applied, last_membership) = {
            let state = self.inner.state.read();
            let applied = self.inner.applied.read();
            let data = encode_snapshot(&state, self.inner.compress)
                .map_err(|e| snapshot_error(e, ErrorVerb::Write))?;
            (data, applied.last_applied, applied.last_membership.clone())
        };

        let snapshot_id = format!(
            "snapshot-{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            chrono::Utc::now().timestamp_millis()
        );
        let stored = StoredSnapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership,
                snapshot_id: snapshot_id.clone(),
            },
            data,
        };

        self.persist_snapshot(&stored).await?;
        info!("Built snapshot {} with {} bytes", snapshot_id, stored.data.len());

        let snapshot = Snapshot {
            meta: stored.meta.clone(),
            snapshot: Box::new(Cursor::new(stored.data.clone())),
        };
        *self.inner.snapshot.write() = Some(stored);
        Ok(snapshot)
    }
}

impl RaftStateMachine<TypeConfig> for DatabaseStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        let applied = self.inner.applied.read();
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<RaftResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        Ok(self.apply_entries(entries.into_iter().collect()))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let installed = decode_snapshot(&data).map_err(|e| snapshot_error(e, ErrorVerb::Read))?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        self.persist_snapshot(&stored).await?;

        {
            let mut state = self.inner.state.write();
            *state = installed;
            let mut applied = self.inner.applied.write();
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership.clone();
            self.inner
                .publisher
                .publish(DatabaseEvent::SnapshotInstalled(Arc::new(state.clone())));
        }
        *self.inner.snapshot.write() = Some(stored);

        info!("Snapshot installed: {:?}", meta.snapshot_id);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.inner.snapshot.read().as_ref().map(|stored| Snapshot {
            meta: stored.meta.clone(),
            snapshot: Box::new(Cursor::new(stored.data.clone())),
        }))
    }
}
