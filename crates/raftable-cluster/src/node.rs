// Cluster node identities

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Cluster-wide unique member id, as written in the membership definition file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A member descriptor: `{"id": "...", "ip": "...", "tcpPort": 9876}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerNode {
    pub id: NodeId,
    pub ip: String,
    pub tcp_port: u16,
}

impl ControllerNode {
    pub fn new(id: impl Into<NodeId>, ip: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            tcp_port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.ip, self.tcp_port).parse()
    }
}

impl Display for ControllerNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.tcp_port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Active,
    Inactive,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "ACTIVE"),
            NodeState::Inactive => write!(f, "INACTIVE"),
        }
    }
}
