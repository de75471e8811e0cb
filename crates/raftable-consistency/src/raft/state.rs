// In-memory database state driven by committed commands
// Deterministic: every replica applying the same commands in the same order
// ends up with identical tables, values and versions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;

use raftable_api::{
    BatchReadRequest, BatchWriteRequest, DatabaseError, ReadResult, ReadStatus, TableMetadata,
    TableModificationEvent, VersionedValue, WriteRequest, WriteResult, WriteStatus,
};
use serde::{Deserialize, Serialize};

use super::events::DatabaseEvent;
use super::request::{DatabaseQuery, OperationResult, RaftRequest, RaftResponse};

// Snapshot format markers, first byte of every encoded snapshot
const FORMAT_JSON: u8 = 0;
const FORMAT_ZSTD: u8 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub metadata: TableMetadata,
    pub entries: HashMap<String, VersionedValue>,
}

impl Table {
    fn new(metadata: TableMetadata) -> Self {
        Self {
            metadata,
            entries: HashMap::new(),
        }
    }
}

/// All tables plus the version counter shared by every key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseState {
    tables: BTreeMap<String, Table>,
    version_counter: u64,
}

impl DatabaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// The most recently assigned version, 0 before the first put
    pub fn version_counter(&self) -> u64 {
        self.version_counter
    }

    /// Apply one committed command, appending the resulting events to `events`
    pub fn apply(&mut self, request: &RaftRequest, events: &mut Vec<DatabaseEvent>) -> RaftResponse {
        match request {
            RaftRequest::CreateTable { name, ttl_millis } => {
                RaftResponse::TableCreated(self.create_table(name, *ttl_millis, events))
            }
            RaftRequest::DropTable { name } => {
                RaftResponse::TableDropped(self.drop_table(name, events))
            }
            RaftRequest::DropAllTables => RaftResponse::AllTablesDropped(self.drop_all_tables(events)),
            RaftRequest::Write { batch } => RaftResponse::Written(self.write(batch, events)),
        }
    }

    /// Answer a query from local state
    pub fn query(&self, query: &DatabaseQuery) -> OperationResult {
        match query {
            DatabaseQuery::ListTables => OperationResult::Tables(self.list_tables()),
            DatabaseQuery::Read { batch } => OperationResult::Read(self.read(batch)),
            DatabaseQuery::GetAll { table } => OperationResult::Rows(self.get_all(table)),
        }
    }

    /// Returns false when the table already exists
    pub fn create_table(
        &mut self,
        name: &str,
        ttl_millis: Option<u32>,
        events: &mut Vec<DatabaseEvent>,
    ) -> bool {
        if self.tables.contains_key(name) {
            return false;
        }
        let metadata = match ttl_millis {
            Some(ttl) => TableMetadata::with_ttl(name, ttl),
            None => TableMetadata::new(name),
        };
        self.tables
            .insert(name.to_string(), Table::new(metadata.clone()));
        events.push(DatabaseEvent::TableCreated(metadata));
        true
    }

    pub fn drop_table(&mut self, name: &str, events: &mut Vec<DatabaseEvent>) -> bool {
        if self.tables.remove(name).is_none() {
            return false;
        }
        events.push(DatabaseEvent::TableDropped(name.to_string()));
        true
    }

    /// Drops every table, returning how many were dropped
    pub fn drop_all_tables(&mut self, events: &mut Vec<DatabaseEvent>) -> usize {
        let dropped = std::mem::take(&mut self.tables);
        let count = dropped.len();
        events.extend(dropped.into_keys().map(DatabaseEvent::TableDropped));
        count
    }

    /// Apply a batch all-or-nothing
    ///
    /// Every precondition is checked against the stored state first. If any
    /// item fails, the remaining OK items report `ABORTED` and nothing is
    /// written; otherwise every item is applied in order and puts receive
    /// fresh versions.
    pub fn write(
        &mut self,
        batch: &BatchWriteRequest,
        events: &mut Vec<DatabaseEvent>,
    ) -> Vec<WriteResult> {
        let mut results: Vec<WriteResult> = batch
            .requests
            .iter()
            .map(|request| self.check(request))
            .collect();

        if results.iter().any(|r| !r.is_ok()) {
            for result in results.iter_mut().filter(|r| r.is_ok()) {
                result.status = WriteStatus::Aborted;
            }
            return results;
        }

        for (request, result) in batch.requests.iter().zip(results.iter_mut()) {
            result.previous_value = self.mutate(request, events);
        }
        results
    }

    fn check(&self, request: &WriteRequest) -> WriteResult {
        let Some(table) = self.tables.get(request.table_name()) else {
            return WriteResult::new(WriteStatus::NoSuchTable, None);
        };
        let current = table.entries.get(request.key());
        let status = if request.precondition_holds(current) {
            WriteStatus::Ok
        } else {
            WriteStatus::PreconditionViolation
        };
        WriteResult::new(status, current.cloned())
    }

    /// Applies a checked request, returning the value it replaced
    fn mutate(
        &mut self,
        request: &WriteRequest,
        events: &mut Vec<DatabaseEvent>,
    ) -> Option<VersionedValue> {
        let table_name = request.table_name();
        let key = request.key();

        match request.new_value() {
            Some(value) => {
                self.version_counter += 1;
                let stored = VersionedValue::new(value, self.version_counter);
                let table = self.tables.get_mut(table_name)?;
                let previous = table.entries.insert(key.to_string(), stored.clone());
                let event = if previous.is_some() {
                    TableModificationEvent::row_updated(table_name, key, stored)
                } else {
                    TableModificationEvent::row_added(table_name, key, stored)
                };
                events.push(DatabaseEvent::TableModified(event));
                previous
            }
            None => {
                let removed = self.tables.get_mut(table_name)?.entries.remove(key)?;
                events.push(DatabaseEvent::TableModified(
                    TableModificationEvent::row_deleted(table_name, key, removed.clone()),
                ));
                Some(removed)
            }
        }
    }

    pub fn list_tables(&self) -> BTreeSet<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn read(&self, batch: &BatchReadRequest) -> Vec<ReadResult> {
        batch
            .requests
            .iter()
            .map(|request| match self.tables.get(&request.table_name) {
                Some(table) => ReadResult {
                    status: ReadStatus::Ok,
                    table_name: request.table_name.clone(),
                    key: request.key.clone(),
                    value: table.entries.get(&request.key).cloned(),
                },
                None => ReadResult {
                    status: ReadStatus::NoSuchTable,
                    table_name: request.table_name.clone(),
                    key: request.key.clone(),
                    value: None,
                },
            })
            .collect()
    }

    /// Copy of a table's rows; empty when the table does not exist
    pub fn get_all(&self, table: &str) -> HashMap<String, VersionedValue> {
        self.tables
            .get(table)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }
}

/// Serialize the whole state, optionally zstd-compressed
pub fn encode_snapshot(state: &DatabaseState, compress: bool) -> Result<Vec<u8>, DatabaseError> {
    let json = serde_json::to_vec(state)
        .map_err(|e| DatabaseError::SnapshotFailure(format!("encode: {}", e)))?;

    let mut out = Vec::with_capacity(json.len() / 2 + 1);
    if compress {
        let compressed = zstd::encode_all(Cursor::new(json), ZSTD_LEVEL)
            .map_err(|e| DatabaseError::SnapshotFailure(format!("compress: {}", e)))?;
        out.push(FORMAT_ZSTD);
        out.extend_from_slice(&compressed);
    } else {
        out.push(FORMAT_JSON);
        out.extend_from_slice(&json);
    }
    Ok(out)
}

/// Decode a snapshot written by [`encode_snapshot`], compressed or not
pub fn decode_snapshot(bytes: &[u8]) -> Result<DatabaseState, DatabaseError> {
    let Some((marker, body)) = bytes.split_first() else {
        return Err(DatabaseError::SnapshotFailure("empty snapshot".to_string()));
    };

    let json = match *marker {
        FORMAT_JSON => body.to_vec(),
        FORMAT_ZSTD => zstd::decode_all(Cursor::new(body))
            .map_err(|e| DatabaseError::SnapshotFailure(format!("decompress: {}", e)))?,
        other => {
            return Err(DatabaseError::SnapshotFailure(format!(
                "unknown snapshot format {}",
                other
            )));
        }
    };

    serde_json::from_slice(&json).map_err(|e| DatabaseError::SnapshotFailure(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use raftable_api::TableModificationType;

    use super::*;

    fn state_with_table(name: &str) -> DatabaseState {
        let mut state = DatabaseState::new();
        state.create_table(name, None, &mut Vec::new());
        state
    }

    fn put(state: &mut DatabaseState, table: &str, key: &str, value: &str) -> WriteResult {
        let batch = BatchWriteRequest::single(WriteRequest::put(table, key, value.as_bytes().to_vec()));
        state.write(&batch, &mut Vec::new()).remove(0)
    }

    #[test]
    fn test_create_table_twice() {
        let mut state = DatabaseState::new();
        let mut events = Vec::new();
        assert!(state.create_table("t", Some(200), &mut events));
        assert!(!state.create_table("t", None, &mut events));

        assert_eq!(events.len(), 1);
        assert!(state.table("t").unwrap().metadata.has_ttl());
    }

    #[test]
    fn test_drop_all_emits_one_event_per_table() {
        let mut state = DatabaseState::new();
        for name in ["a", "b", "c"] {
            state.create_table(name, None, &mut Vec::new());
        }
        let mut events = Vec::new();
        assert_eq!(state.drop_all_tables(&mut events), 3);

        let dropped: Vec<String> = events
            .into_iter()
            .filter_map(|e| match e {
                DatabaseEvent::TableDropped(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, vec!["a", "b", "c"]);
        assert!(state.list_tables().is_empty());
    }

    #[test]
    fn test_put_then_update_emits_added_then_updated() {
        let mut state = state_with_table("t");
        let mut events = Vec::new();
        state.write(
            &BatchWriteRequest::builder()
                .put("t", "k", b"1".to_vec())
                .put("t", "k", b"2".to_vec())
                .build(),
            &mut events,
        );

        let kinds: Vec<TableModificationType> = events
            .iter()
            .filter_map(|e| match e {
                DatabaseEvent::TableModified(m) => Some(m.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![TableModificationType::RowAdded, TableModificationType::RowUpdated]
        );
        assert_eq!(state.get_all("t")["k"].value, b"2".to_vec());
    }

    #[test]
    fn test_failed_precondition_aborts_whole_batch() {
        let mut state = state_with_table("t");
        put(&mut state, "t", "b", "existing");

        let batch = BatchWriteRequest::builder()
            .put("t", "a", b"1".to_vec())
            .add(WriteRequest::put_if_absent("t", "b", b"2".to_vec()))
            .build();
        let mut events = Vec::new();
        let results = state.write(&batch, &mut events);

        assert_eq!(results[0].status, WriteStatus::Aborted);
        assert_eq!(results[1].status, WriteStatus::PreconditionViolation);
        assert_eq!(results[1].previous_value.as_ref().unwrap().value, b"existing".to_vec());
        assert!(events.is_empty());
        assert!(!state.get_all("t").contains_key("a"));
    }

    #[test]
    fn test_missing_table_aborts_batch() {
        let mut state = state_with_table("t");
        let batch = BatchWriteRequest::builder()
            .put("t", "a", b"1".to_vec())
            .put("missing", "a", b"1".to_vec())
            .build();
        let results = state.write(&batch, &mut Vec::new());

        assert_eq!(results[0].status, WriteStatus::Aborted);
        assert_eq!(results[1].status, WriteStatus::NoSuchTable);
        assert_eq!(state.version_counter(), 0);
    }

    #[test]
    fn test_conditional_writes_by_version_and_value() {
        let mut state = state_with_table("t");
        let first = put(&mut state, "t", "k", "v1");
        assert!(first.is_ok());
        let version = state.get_all("t")["k"].version;

        let stale = BatchWriteRequest::single(WriteRequest::put_if_version("t", "k", b"x".to_vec(), version + 7));
        assert_eq!(
            state.write(&stale, &mut Vec::new())[0].status,
            WriteStatus::PreconditionViolation
        );

        let fresh = BatchWriteRequest::single(WriteRequest::put_if_version("t", "k", b"v2".to_vec(), version));
        let result = state.write(&fresh, &mut Vec::new()).remove(0);
        assert!(result.is_ok());
        assert_eq!(result.previous_value.unwrap().version, version);

        let wrong_value = BatchWriteRequest::single(WriteRequest::remove_if_value("t", "k", b"v1".to_vec()));
        assert_eq!(
            state.write(&wrong_value, &mut Vec::new())[0].status,
            WriteStatus::PreconditionViolation
        );
        let right_value = BatchWriteRequest::single(WriteRequest::remove_if_value("t", "k", b"v2".to_vec()));
        assert!(state.write(&right_value, &mut Vec::new())[0].is_ok());
        assert!(state.get_all("t").is_empty());
    }

    #[test]
    fn test_remove_missing_key_is_ok_without_event() {
        let mut state = state_with_table("t");
        let mut events = Vec::new();
        let results = state.write(&BatchWriteRequest::single(WriteRequest::remove("t", "nope")), &mut events);

        assert!(results[0].is_ok());
        assert!(results[0].previous_value.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn test_read_reports_missing_table() {
        let mut state = state_with_table("t");
        put(&mut state, "t", "k", "v");

        let results = state.read(&BatchReadRequest::builder().get("t", "k").get("t", "x").get("u", "k").build());
        assert_eq!(results[0].value.as_ref().unwrap().value, b"v".to_vec());
        assert_eq!(results[1].status, ReadStatus::Ok);
        assert!(results[1].value.is_none());
        assert_eq!(results[2].status, ReadStatus::NoSuchTable);
    }

    #[test]
    fn test_snapshot_round_trip_both_formats() {
        let mut state = DatabaseState::new();
        state.create_table("plain", None, &mut Vec::new());
        state.create_table("expiring", Some(1000), &mut Vec::new());
        put(&mut state, "plain", "a", "1");
        put(&mut state, "expiring", "b", "2");

        for compress in [true, false] {
            let bytes = encode_snapshot(&state, compress).unwrap();
            let restored = decode_snapshot(&bytes).unwrap();
            assert_eq!(restored, state);
            assert_eq!(restored.version_counter(), 2);
        }
    }

    #[test]
    fn test_corrupt_snapshot_is_snapshot_failure() {
        assert!(matches!(decode_snapshot(&[]), Err(DatabaseError::SnapshotFailure(_))));
        assert!(matches!(decode_snapshot(&[9, 1, 2]), Err(DatabaseError::SnapshotFailure(_))));
        assert!(matches!(
            decode_snapshot(&[FORMAT_ZSTD, 1, 2, 3]),
            Err(DatabaseError::SnapshotFailure(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_versions_strictly_increase(ops in proptest::collection::vec((0u8..4, 0u8..6), 1..60)) {
            let mut state = state_with_table("t");
            let mut highest = 0u64;
            for (op, key) in ops {
                let key = format!("k{}", key);
                let request = match op {
                    0 => WriteRequest::put("t", &key, b"v".to_vec()),
                    1 => WriteRequest::put_if_absent("t", &key, b"v".to_vec()),
                    2 => WriteRequest::remove("t", &key),
                    _ => WriteRequest::put_if_version("t", &key, b"v".to_vec(), highest),
                };
                let mut events = Vec::new();
                state.write(&BatchWriteRequest::single(request), &mut events);
                for event in events {
                    if let DatabaseEvent::TableModified(m) = event
                        && m.kind != TableModificationType::RowDeleted
                    {
                        prop_assert!(m.value.version > highest);
                        highest = m.value.version;
                    }
                }
            }
            prop_assert_eq!(state.version_counter(), highest);
        }
    }
}
