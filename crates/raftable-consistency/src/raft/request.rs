// Database commands, queries and their results
// Commands are replicated through the log; queries are answered from local state

use std::collections::{BTreeSet, HashMap};

use raftable_api::{BatchReadRequest, BatchWriteRequest, ReadResult, VersionedValue, WriteResult};
use serde::{Deserialize, Serialize};

/// State machine commands, one per replicated log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    CreateTable {
        name: String,
        ttl_millis: Option<u32>,
    },
    DropTable {
        name: String,
    },
    DropAllTables,
    Write {
        batch: BatchWriteRequest,
    },
}

impl RaftRequest {
    /// Operation name used in logs and error messages
    pub fn op_type(&self) -> &'static str {
        match self {
            RaftRequest::CreateTable { .. } => "createTable",
            RaftRequest::DropTable { .. } => "dropTable",
            RaftRequest::DropAllTables => "dropAllTables",
            RaftRequest::Write { .. } => "write",
        }
    }
}

/// Result of applying one log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    TableCreated(bool),
    TableDropped(bool),
    AllTablesDropped(usize),
    Written(Vec<WriteResult>),
    /// Blank and membership entries
    Empty,
}

/// Read-only operations served without appending to the log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseQuery {
    ListTables,
    Read { batch: BatchReadRequest },
    GetAll { table: String },
}

impl DatabaseQuery {
    pub fn op_type(&self) -> &'static str {
        match self {
            DatabaseQuery::ListTables => "listTables",
            DatabaseQuery::Read { .. } => "read",
            DatabaseQuery::GetAll { .. } => "getAll",
        }
    }
}

/// Anything a client can submit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseOperation {
    Command(RaftRequest),
    Query(DatabaseQuery),
}

impl DatabaseOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseOperation::Command(command) => command.op_type(),
            DatabaseOperation::Query(query) => query.op_type(),
        }
    }
}

impl From<RaftRequest> for DatabaseOperation {
    fn from(command: RaftRequest) -> Self {
        DatabaseOperation::Command(command)
    }
}

impl From<DatabaseQuery> for DatabaseOperation {
    fn from(query: DatabaseQuery) -> Self {
        DatabaseOperation::Query(query)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Command(RaftResponse),
    Tables(BTreeSet<String>),
    Read(Vec<ReadResult>),
    Rows(HashMap<String, VersionedValue>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        let ops: Vec<DatabaseOperation> = vec![
            RaftRequest::CreateTable {
                name: "t".into(),
                ttl_millis: None,
            }
            .into(),
            RaftRequest::DropTable { name: "t".into() }.into(),
            RaftRequest::DropAllTables.into(),
            RaftRequest::Write {
                batch: BatchWriteRequest::default(),
            }
            .into(),
            DatabaseQuery::ListTables.into(),
            DatabaseQuery::Read {
                batch: BatchReadRequest::default(),
            }
            .into(),
            DatabaseQuery::GetAll { table: "t".into() }.into(),
        ];
        let names: Vec<&str> = ops.iter().map(|op| op.name()).collect();
        assert_eq!(
            names,
            vec![
                "createTable",
                "dropTable",
                "dropAllTables",
                "write",
                "listTables",
                "read",
                "getAll"
            ]
        );
    }
}
