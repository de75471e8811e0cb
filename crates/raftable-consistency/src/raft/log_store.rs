// Raft log storage over the persistent log
// Implements openraft's RaftLogStorage on top of ConsensusLog. Entries are
// stored as serialized LogRecords; purging compacts the log behind a
// snapshot-boundary record that remembers the purged log id.

// Allow large error types - StorageError is from openraft and follows their design patterns
#![allow(clippy::result_large_err)]

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{ErrorSubject, ErrorVerb, OptionalSend, RaftLogReader, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::log::{ConsensusLog, LogError, LogOptions};
use super::types::{Entry, LogId, NodeId, TypeConfig, Vote};

// Metadata keys
const META_VOTE: &str = "vote";
const META_COMMITTED: &str = "committed";

/// Helper to create StorageError for vote operations
fn vote_error(e: impl std::error::Error, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(ErrorSubject::Vote, verb, std::io::Error::other(e.to_string()))
}

/// Helper to create StorageError for log operations
fn logs_error(e: impl std::error::Error, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(ErrorSubject::Logs, verb, std::io::Error::other(e.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Entry(Entry),
    /// Stands in for every entry up to and including this id
    Boundary(LogId),
}

impl LogRecord {
    fn log_id(&self) -> LogId {
        match self {
            LogRecord::Entry(entry) => entry.log_id,
            LogRecord::Boundary(log_id) => *log_id,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError<NodeId>> {
        serde_json::to_vec(self).map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError<NodeId>> {
        serde_json::from_slice(bytes).map_err(|e| logs_error(e, ErrorVerb::Read))
    }
}

#[derive(Default)]
struct CachedState {
    last_log_id: Option<LogId>,
    last_purged: Option<LogId>,
    vote: Option<Vote>,
    committed: Option<LogId>,
}

/// openraft log storage backed by a [`ConsensusLog`]
#[derive(Clone)]
pub struct RaftLogStore {
    log: Arc<ConsensusLog>,
    state: Arc<RwLock<CachedState>>,
}

impl RaftLogStore {
    /// Open the log at `path`; openraft numbers its first entry 0
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<NodeId>> {
        let log = ConsensusLog::open_at(
            path,
            LogOptions {
                initial_index: 0,
                sync_writes: true,
            },
        )
        .map_err(|e| logs_error(e, ErrorVerb::Read))?;
        Self::from_log(Arc::new(log))
    }

    pub fn from_log(log: Arc<ConsensusLog>) -> Result<Self, StorageError<NodeId>> {
        let store = Self {
            log,
            state: Arc::new(RwLock::new(CachedState::default())),
        };
        store.load_cached_values()?;
        info!(path = %store.log.path().display(), "Raft log store initialized");
        Ok(store)
    }

    /// The underlying persistent log
    pub fn log(&self) -> &Arc<ConsensusLog> {
        &self.log
    }

    fn load_cached_values(&self) -> Result<(), StorageError<NodeId>> {
        let vote = self
            .read_meta::<Vote>(META_VOTE)
            .map_err(|e| vote_error(e, ErrorVerb::Read))?;
        let committed = self
            .read_meta::<LogId>(META_COMMITTED)
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;

        let last_purged = match self.first_record()? {
            Some(LogRecord::Boundary(log_id)) => Some(log_id),
            _ => None,
        };
        let last_log_id = self.last_record()?.map(|r| r.log_id()).or(last_purged);

        let mut state = self.state.write();
        state.vote = vote;
        state.committed = committed;
        state.last_purged = last_purged;
        state.last_log_id = last_log_id;
        Ok(())
    }

    fn read_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MetaError> {
        match self.log.get_metadata(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MetaError> {
        let bytes = serde_json::to_vec(value)?;
        self.log.put_metadata(key, &bytes)?;
        Ok(())
    }

    fn record_at(&self, index: Option<u64>) -> Result<Option<LogRecord>, StorageError<NodeId>> {
        let Some(index) = index else {
            return Ok(None);
        };
        match self
            .log
            .get_entry(index)
            .map_err(|e| logs_error(e, ErrorVerb::Read))?
        {
            Some(bytes) => LogRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn first_record(&self) -> Result<Option<LogRecord>, StorageError<NodeId>> {
        let first = self
            .log
            .first_index()
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;
        self.record_at(first)
    }

    fn last_record(&self) -> Result<Option<LogRecord>, StorageError<NodeId>> {
        let last = self
            .log
            .last_index()
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;
        self.record_at(last)
    }

    /// Entries (not boundaries) within `range` that are present in the log
    fn read_entries<RB: RangeBounds<u64>>(&self, range: RB) -> Result<Vec<Entry>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => Some(n),
            Bound::Excluded(&0) => return Ok(Vec::new()),
            Bound::Excluded(&n) => Some(n - 1),
            Bound::Unbounded => None,
        };

        let read_err = |e: LogError| logs_error(e, ErrorVerb::Read);
        let (Some(first), Some(last)) = (
            self.log.first_index().map_err(read_err)?,
            self.log.last_index().map_err(read_err)?,
        ) else {
            return Ok(Vec::new());
        };

        let from = start.max(first);
        let to = end.map_or(last, |e| e.min(last));
        if from > to {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for bytes in self.log.get_entries(from, to).map_err(read_err)? {
            if let LogRecord::Entry(entry) = LogRecord::decode(&bytes)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Persist entries that must continue the log contiguously
    fn append_records(&self, entries: Vec<Entry>) -> Result<(), StorageError<NodeId>> {
        let Some(last) = entries.last().map(|e| e.log_id) else {
            return Ok(());
        };

        let next = self
            .log
            .next_index()
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        if entries[0].log_id.index != next {
            return Err(logs_error(
                LogError::Corrupted(format!(
                    "append at index {} but the log continues at {}",
                    entries[0].log_id.index, next
                )),
                ErrorVerb::Write,
            ));
        }

        let encoded = entries
            .into_iter()
            .map(|entry| LogRecord::Entry(entry).encode())
            .collect::<Result<Vec<_>, _>>()?;
        self.log
            .append_entries(&encoded)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;

        self.state.write().last_log_id = Some(last);
        Ok(())
    }

    fn refresh_last_log_id(&self) -> Result<(), StorageError<NodeId>> {
        let last = self.last_record()?.map(|r| r.log_id());
        let mut state = self.state.write();
        state.last_log_id = last.or(state.last_purged);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
enum MetaError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        let entries = self.read_entries(range.clone())?;
        debug!("Read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let state = self.state.read();
        Ok(LogState {
            last_purged_log_id: state.last_purged,
            last_log_id: state.last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError<NodeId>> {
        self.write_meta(META_VOTE, vote)
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;
        self.state.write().vote = Some(*vote);
        debug!("Saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError<NodeId>> {
        Ok(self.state.read().vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(META_COMMITTED, &committed)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        self.state.write().committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError<NodeId>> {
        Ok(self.state.read().committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        self.append_records(entries.into_iter().collect())?;
        // every write batch is synced before append_entries returns
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        // openraft truncates inclusively: log_id itself conflicts
        self.log
            .remove_from(log_id.index)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;
        self.refresh_last_log_id()?;
        debug!("Truncated logs since index {}", log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        if self.state.read().last_purged.is_some_and(|p| p.index >= log_id.index) {
            return Ok(());
        }
        let boundary = LogRecord::Boundary(log_id).encode()?;
        self.log
            .compact(log_id.index, &boundary)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;
        self.state.write().last_purged = Some(log_id);
        self.refresh_last_log_id()?;
        debug!("Purged logs up to index {}", log_id.index);
        Ok(())
    }
}
