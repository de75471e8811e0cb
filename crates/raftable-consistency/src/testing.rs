// In-memory DatabaseService for unit tests
// Applies commands straight to a DatabaseState and publishes the same events
// the replicated state machine would.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use raftable_api::{
    BatchReadRequest, BatchWriteRequest, DatabaseError, DatabaseService, ReadResult, Result,
    VersionedValue, WriteRequest, WriteResult,
};
use tokio::sync::{Semaphore, mpsc};

use crate::raft::events::{DatabaseEvent, DatabaseEventPublisher};
use crate::raft::request::{RaftRequest, RaftResponse};
use crate::raft::state::DatabaseState;

#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<DatabaseState>,
    publisher: DatabaseEventPublisher,
    /// Conditional inserts still to fail as if consensus were unavailable
    failing_inserts: AtomicUsize,
    /// key -> permits a conditional insert on that key must take first
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MemoryDatabase {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        self.publisher.subscribe()
    }

    /// Fail the next `count` conditional inserts with ConsensusUnavailable
    pub fn fail_conditional_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Hold conditional inserts on `key` until the returned semaphore gets
    /// a permit
    pub fn gate(&self, key: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(key.to_string(), gate.clone());
        gate
    }

    fn conditional_insert_key(batch: &BatchWriteRequest) -> Option<&str> {
        batch.requests.iter().find_map(|request| match request {
            WriteRequest::PutIfAbsent { key, .. } => Some(key.as_str()),
            _ => None,
        })
    }

    fn apply(&self, request: RaftRequest) -> RaftResponse {
        let mut events = Vec::new();
        let response = self.state.lock().apply(&request, &mut events);
        self.publisher.publish_all(events);
        response
    }
}

#[async_trait]
impl DatabaseService for MemoryDatabase {
    async fn create_table(&self, name: &str) -> Result<bool> {
        let request = RaftRequest::CreateTable {
            name: name.to_string(),
            ttl_millis: None,
        };
        Ok(matches!(self.apply(request), RaftResponse::TableCreated(true)))
    }

    async fn create_table_with_ttl(&self, name: &str, ttl_millis: u32) -> Result<bool> {
        let request = RaftRequest::CreateTable {
            name: name.to_string(),
            ttl_millis: Some(ttl_millis),
        };
        Ok(matches!(self.apply(request), RaftResponse::TableCreated(true)))
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        self.apply(RaftRequest::DropTable {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn drop_all_tables(&self) -> Result<()> {
        self.apply(RaftRequest::DropAllTables);
        Ok(())
    }

    async fn list_tables(&self) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().list_tables())
    }

    async fn batch_read(&self, batch: BatchReadRequest) -> Result<Vec<ReadResult>> {
        Ok(self.state.lock().read(&batch))
    }

    async fn batch_write(&self, batch: BatchWriteRequest) -> Result<Vec<WriteResult>> {
        if let Some(key) = Self::conditional_insert_key(&batch) {
            let gate = self.gates.lock().get(key).cloned();
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            let failing = self.failing_inserts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            });
            if failing.is_ok() {
                return Err(DatabaseError::ConsensusUnavailable(
                    "no leader".to_string(),
                ));
            }
        }
        match self.apply(RaftRequest::Write { batch }) {
            RaftResponse::Written(results) => Ok(results),
            other => panic!("unexpected response {:?}", other),
        }
    }

    async fn get_all(&self, table: &str) -> Result<HashMap<String, VersionedValue>> {
        Ok(self.state.lock().get_all(table))
    }
}
