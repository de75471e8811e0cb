//! Replicated versioned tables for raftable
//!
//! - `raft`: persistent log, state machine, transport and the openraft engine
//! - `client`: routes table operations to the current leader
//! - `manager`: activation and teardown of a node
//! - `ttl`: expiration of rows in TTL tables
//! - `lock`: distributed locks stored in a TTL table

pub mod client;
pub mod lock;
pub mod manager;
pub mod raft;
pub mod tablet;
pub mod ttl;

#[cfg(test)]
mod testing;

pub use client::DatabaseClient;
pub use lock::{DistributedLock, LockManager, LockStats};
pub use manager::DatabaseManager;
pub use raft::{ConsensusEngine, RaftConfig, RaftEngine};
pub use tablet::Tablet;
pub use ttl::TtlCoordinator;
