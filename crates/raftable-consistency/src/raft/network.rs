// Raft network layer over cluster messaging
// Implements openraft's network traits on top of the consensus protocol clients

use std::future::Future;
use std::sync::Arc;

use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, ReplicationClosed,
    StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Snapshot};
use raftable_api::DatabaseError;
use raftable_cluster::NodeId as MemberId;

use super::protocol::{SyncRequest, SyncResponse};
use super::transport::{ProtocolClient, ProtocolClientManager};
use super::types::{NodeId, TypeConfig, Vote};

/// Factory for creating Raft network connections
///
/// `BasicNode::addr` holds the cluster member id of the target.
#[derive(Clone)]
pub struct RaftableNetworkFactory {
    clients: Arc<ProtocolClientManager>,
}

impl RaftableNetworkFactory {
    pub fn new(clients: Arc<ProtocolClientManager>) -> Self {
        Self { clients }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftableNetworkFactory {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        RaftNetworkConnection {
            target,
            client: self.clients.client(&MemberId::from(node.addr.as_str())),
        }
    }
}

/// A network connection to a remote Raft node
pub struct RaftNetworkConnection {
    target: NodeId,
    client: Arc<ProtocolClient>,
}

/// Transport failures: unreachable peers are retried by openraft with backoff
fn transport_error<E: std::error::Error>(e: DatabaseError) -> RPCError<NodeId, BasicNode, E> {
    match e {
        DatabaseError::Messaging(_) => RPCError::Unreachable(Unreachable::new(&e)),
        _ => RPCError::Network(NetworkError::new(&e)),
    }
}

/// The peer answered with an error of its own
fn remote_error<E: std::error::Error>(message: String) -> RPCError<NodeId, BasicNode, E> {
    RPCError::Network(NetworkError::new(&std::io::Error::other(message)))
}

impl RaftNetworkConnection {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, DatabaseError> {
        match self.client.sync(&request).await? {
            Ok(response) => Ok(response),
            Err(message) => Err(DatabaseError::Messaging(format!(
                "{} rejected by {}: {}",
                request.kind(),
                self.target,
                message
            ))),
        }
    }

    fn unexpected(&self, what: &str) -> DatabaseError {
        DatabaseError::IllegalState(format!("unexpected {} reply from {}", what, self.target))
    }
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        // heartbeats travel as pings, everything else as sync
        if req.entries.is_empty() {
            return self
                .client
                .ping(&req)
                .await
                .map_err(transport_error)?
                .map_err(remote_error);
        }

        match self.client.sync(&SyncRequest::Append(req)).await.map_err(transport_error)? {
            Ok(SyncResponse::Append(response)) => Ok(response),
            Ok(_) => Err(transport_error(self.unexpected("append"))),
            Err(message) => Err(remote_error(message)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        match self
            .client
            .sync(&SyncRequest::InstallSnapshot(req))
            .await
            .map_err(transport_error)?
        {
            Ok(SyncResponse::InstallSnapshot(response)) => Ok(response),
            Ok(_) => Err(transport_error(self.unexpected("install snapshot"))),
            Err(message) => Err(remote_error(message)),
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let request = SyncRequest::FullSnapshot {
            vote,
            meta: snapshot.meta,
            data: snapshot.snapshot.into_inner(),
        };
        match self.sync(request).await {
            Ok(SyncResponse::FullSnapshot(response)) => Ok(response),
            Ok(_) => Err(StreamingError::Network(NetworkError::new(&self.unexpected("snapshot")))),
            Err(e @ DatabaseError::Messaging(_)) => Err(StreamingError::Unreachable(Unreachable::new(&e))),
            Err(e) => Err(StreamingError::Network(NetworkError::new(&e))),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.client
            .poll(&req)
            .await
            .map_err(transport_error)?
            .map_err(remote_error)
    }
}
