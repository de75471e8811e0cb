// Raft-based replication
// Persistent log, replicated state machine, transport and the consensus engine
// that ties them together on top of openraft.

pub mod config;
pub mod engine;
pub mod events;
pub mod log;
pub mod log_store;
pub mod network;
pub mod protocol;
pub mod request;
pub mod server;
pub mod state;
pub mod state_machine;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use engine::{ConsensusEngine, LeaderInfo, RaftEngine};
pub use events::{DatabaseEvent, DatabaseEventPublisher};
pub use log::{ConsensusLog, LogError, LogOptions};
pub use log_store::RaftLogStore;
pub use network::RaftableNetworkFactory;
pub use protocol::ProtocolHandler;
pub use request::{DatabaseOperation, DatabaseQuery, OperationResult, RaftRequest, RaftResponse};
pub use server::RaftProtocolServer;
pub use state::DatabaseState;
pub use state_machine::DatabaseStateMachine;
pub use transport::{ProtocolClient, ProtocolClientConfig, ProtocolClientManager};
pub use types::{NodeId, TypeConfig, calculate_node_id};
