//! Cluster messaging substrate for raftable
//!
//! Nodes exchange opaque payloads addressed by subject. Request/response,
//! one-way unicast and broadcast are all expressed through [`ClusterCommunicator`],
//! with an in-process implementation for tests ([`local`]) and a framed TCP one
//! for deployments ([`tcp`]).

pub mod communicator;
pub mod heartbeat;
pub mod local;
pub mod membership;
pub mod message;
pub mod node;
pub mod tcp;

pub use communicator::{
    ClusterCommunicator, ClusterMessageHandler, MessagingError, SubscriberRegistry, handler_fn,
};
pub use membership::{Membership, MembershipEvent, MembershipEventType};
pub use message::{ClusterMessage, MessageSubject};
pub use node::{ControllerNode, NodeId, NodeState};
