// Consensus RPC protocol carried over cluster messaging
// Subjects, wire types and the handler interface the transport dispatches to

use async_trait::async_trait;
use bytes::Bytes;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use raftable_api::{DatabaseError, TableModificationEvent};
use raftable_cluster::{MessageSubject, NodeId as MemberId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::request::{DatabaseOperation, OperationResult};
use super::types::{NodeId, SnapshotMeta, TypeConfig, Vote};

/// Heartbeats: append-entries requests without entries
pub const PING_SUBJECT: MessageSubject = MessageSubject::from_static("raft-consensus-ping");
/// Log replication and snapshot transfer
pub const SYNC_SUBJECT: MessageSubject = MessageSubject::from_static("raft-consensus-sync");
/// Vote requests
pub const POLL_SUBJECT: MessageSubject = MessageSubject::from_static("raft-consensus-poll");
/// Client commands and queries
pub const SUBMIT_SUBJECT: MessageSubject = MessageSubject::from_static("raft-consensus-submit");
/// Periodic "I am the leader" broadcast
pub const LEADER_ELECTION_SUBJECT: MessageSubject =
    MessageSubject::from_static("raft-leader-election-event");
/// Row deletions rebroadcast by the leader
pub const DATABASE_UPDATE_SUBJECT: MessageSubject =
    MessageSubject::from_static("database-update-event");

/// Every consensus subject served by a member
pub const CONSENSUS_SUBJECTS: [MessageSubject; 4] =
    [PING_SUBJECT, SYNC_SUBJECT, POLL_SUBJECT, SUBMIT_SUBJECT];

/// Remote failures travel as strings; the receiving side only logs them
pub type Reply<T> = Result<T, String>;

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncRequest {
    Append(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    FullSnapshot {
        vote: Vote,
        meta: SnapshotMeta,
        data: Vec<u8>,
    },
}

impl SyncRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncRequest::Append(_) => "append",
            SyncRequest::InstallSnapshot(_) => "installSnapshot",
            SyncRequest::FullSnapshot { .. } => "fullSnapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum SyncResponse {
    Append(AppendEntriesResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    FullSnapshot(SnapshotResponse<NodeId>),
}

/// Sent on [`LEADER_ELECTION_SUBJECT`] while a node holds leadership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAdvertisement {
    pub leader: MemberId,
    pub term: u64,
}

/// Sent on [`DATABASE_UPDATE_SUBJECT`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseUpdate {
    pub event: TableModificationEvent,
}

/// The consensus engine as seen by the transport server
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn ping(&self, request: AppendEntriesRequest<TypeConfig>) -> Reply<AppendEntriesResponse<NodeId>>;

    async fn sync(&self, request: SyncRequest) -> Reply<SyncResponse>;

    async fn poll(&self, request: VoteRequest<NodeId>) -> Reply<VoteResponse<NodeId>>;

    async fn submit(&self, operation: DatabaseOperation) -> Result<OperationResult, DatabaseError>;
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, DatabaseError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DatabaseError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_are_distinct() {
        let consensus_subjects = CONSENSUS_SUBJECTS;
        let leader_election_subject = LEADER_ELECTION_SUBJECT;
        let database_update_subject = DATABASE_UPDATE_SUBJECT;
        let mut all: Vec<&str> = consensus_subjects.iter().map(|s| s.as_str()).collect();
        all.push(leader_election_subject.as_str());
        all.push(database_update_subject.as_str());
        let unique: std::collections::HashSet<&str> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_advertisement_wire_format() {
        let ad = LeaderAdvertisement {
            leader: MemberId::from("node-1"),
            term: 4,
        };
        let bytes = encode(&ad).unwrap();
        assert_eq!(decode::<LeaderAdvertisement>(&bytes).unwrap(), ad);
    }
}
