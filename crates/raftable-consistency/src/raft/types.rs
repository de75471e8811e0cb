// Raft type configuration for openraft
// Defines the type aliases used by the consensus engine adapter

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};
use openraft::BasicNode;

use super::request::{RaftRequest, RaftResponse};

/// Consensus node id, derived from the cluster member id
pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = RaftRequest,
        R = RaftResponse,
        Node = BasicNode,
        NodeId = NodeId,
);

/// Type alias for the Raft instance
pub type Raft = openraft::Raft<TypeConfig>;

/// Type alias for log entries
pub type Entry = openraft::Entry<TypeConfig>;

/// Type alias for log ID
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for stored membership
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

/// Type alias for metrics
pub type RaftMetrics = openraft::RaftMetrics<NodeId, BasicNode>;

/// Derive the consensus node id of a cluster member
///
/// The first eight bytes of the MD5 digest of the member id, so every node
/// computes the same id for a member without coordination.
pub fn calculate_node_id(member_id: &str) -> NodeId {
    let digest = Md5::digest(member_id.as_bytes());
    BigEndian::read_u64(&digest[..8])
}

/// The openraft node descriptor of a cluster member: its member id as address
pub fn basic_node(member_id: &str) -> BasicNode {
    BasicNode::new(member_id)
}
