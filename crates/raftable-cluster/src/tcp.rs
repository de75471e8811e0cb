// TCP cluster messaging
// Frames are length delimited. Each frame carries a JSON header (kind, sender,
// subject) prefixed by its u32 length, followed by the raw payload bytes.
// Outbound connections are pooled per peer and used by one exchange at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::communicator::{
    ClusterCommunicator, ClusterMessageHandler, MessagingError, SubscriberRegistry,
};
use crate::membership::Membership;
use crate::message::{ClusterMessage, MessageSubject};
use crate::node::{ControllerNode, NodeId};

/// Configuration for the TCP communicator
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Idle connections kept per peer
    pub max_idle_connections: usize,
    /// Largest accepted frame, snapshots included
    pub max_frame_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            max_idle_connections: 4,
            max_frame_length: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum FrameKind {
    Request,
    OneWay,
    Reply,
    NoReply,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    kind: FrameKind,
    sender: NodeId,
    subject: MessageSubject,
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Bytes, MessagingError> {
    let header = serde_json::to_vec(header).map_err(|e| MessagingError::Codec(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn decode_frame(mut frame: Bytes) -> Result<(FrameHeader, Bytes), MessagingError> {
    if frame.len() < 4 {
        return Err(MessagingError::Codec("frame shorter than header length".to_string()));
    }
    let header_len = frame.get_u32() as usize;
    if frame.len() < header_len {
        return Err(MessagingError::Codec(format!(
            "header length {} exceeds frame of {} bytes",
            header_len,
            frame.len()
        )));
    }
    let header_bytes = frame.split_to(header_len);
    let header =
        serde_json::from_slice(&header_bytes).map_err(|e| MessagingError::Codec(e.to_string()))?;
    Ok((header, frame))
}

fn new_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

pub struct TcpCommunicator {
    local: ControllerNode,
    membership: Arc<Membership>,
    subscribers: Arc<SubscriberRegistry>,
    idle: DashMap<NodeId, Vec<Connection>>,
    config: TcpConfig,
    cancel: CancellationToken,
}

impl TcpCommunicator {
    /// Binds the local node's address and starts accepting peers.
    pub async fn bind(membership: Arc<Membership>, config: TcpConfig) -> Result<Arc<Self>, MessagingError> {
        let addr = membership.local_node().socket_addr().map_err(|e| {
            MessagingError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::with_listener(membership, listener, config))
    }

    pub fn with_listener(membership: Arc<Membership>, listener: TcpListener, config: TcpConfig) -> Arc<Self> {
        let this = Arc::new(Self {
            local: membership.local_node().clone(),
            membership,
            subscribers: Arc::new(SubscriberRegistry::new()),
            idle: DashMap::new(),
            config,
            cancel: CancellationToken::new(),
        });
        if let Ok(addr) = listener.local_addr() {
            info!(node = %this.local.id, %addr, "Cluster messaging listening");
        }
        tokio::spawn(accept_loop(
            listener,
            this.local.id.clone(),
            this.subscribers.clone(),
            this.config.max_frame_length,
            this.cancel.clone(),
        ));
        this
    }

    /// Stops accepting connections and drops pooled ones.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.idle.clear();
        info!(node = %self.local.id, "Cluster messaging stopped");
    }

    async fn connect(&self, to: &NodeId) -> Result<Connection, MessagingError> {
        let node = self
            .membership
            .node(to)
            .ok_or_else(|| MessagingError::UnknownNode(to.clone()))?;
        let addr = node
            .socket_addr()
            .map_err(|e| MessagingError::Unreachable(to.clone(), e.to_string()))?;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MessagingError::Unreachable(to.clone(), "connect timed out".to_string()))?
            .map_err(|e| MessagingError::Unreachable(to.clone(), e.to_string()))?;
        stream.set_nodelay(true)?;
        trace!(to = %to, %addr, "Opened cluster connection");
        Ok(Framed::new(stream, new_codec(self.config.max_frame_length)))
    }

    fn checkout(&self, to: &NodeId) -> Option<Connection> {
        self.idle.get_mut(to).and_then(|mut pool| pool.pop())
    }

    fn checkin(&self, to: &NodeId, conn: Connection) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut pool = self.idle.entry(to.clone()).or_default();
        if pool.len() < self.config.max_idle_connections {
            pool.push(conn);
        }
    }

    async fn exchange(
        conn: &mut Connection,
        frame: Bytes,
        expect_reply: bool,
    ) -> Result<Option<(FrameHeader, Bytes)>, MessagingError> {
        conn.send(frame).await?;
        if !expect_reply {
            return Ok(None);
        }
        match conn.next().await {
            Some(Ok(reply)) => decode_frame(reply.freeze()).map(Some),
            Some(Err(e)) => Err(e.into()),
            None => Err(MessagingError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }

    fn into_reply(
        to: &NodeId,
        reply: Option<(FrameHeader, Bytes)>,
    ) -> Result<Option<Bytes>, MessagingError> {
        match reply {
            None => Ok(None),
            Some((header, body)) => match header.kind {
                FrameKind::Reply => Ok(Some(body)),
                FrameKind::NoReply => Err(MessagingError::NoResponse(to.clone())),
                kind => Err(MessagingError::Codec(format!("unexpected {:?} frame", kind))),
            },
        }
    }

    async fn deliver(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
        kind: FrameKind,
    ) -> Result<Option<Bytes>, MessagingError> {
        if self.cancel.is_cancelled() {
            return Err(MessagingError::Closed);
        }
        if *to == self.local.id {
            return self.deliver_locally(subject, payload, kind).await;
        }

        let header = FrameHeader {
            kind,
            sender: self.local.id.clone(),
            subject,
        };
        let frame = encode_frame(&header, &payload)?;
        let expect_reply = kind == FrameKind::Request;

        // pooled connections may have been closed by the peer; fall through to a fresh one
        if let Some(mut conn) = self.checkout(to) {
            if let Ok(reply) = Self::exchange(&mut conn, frame.clone(), expect_reply).await {
                self.checkin(to, conn);
                return Self::into_reply(to, reply);
            }
        }

        let mut conn = self.connect(to).await?;
        let reply = Self::exchange(&mut conn, frame, expect_reply)
            .await
            .map_err(|e| MessagingError::Unreachable(to.clone(), e.to_string()))?;
        self.checkin(to, conn);
        Self::into_reply(to, reply)
    }

    async fn deliver_locally(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        kind: FrameKind,
    ) -> Result<Option<Bytes>, MessagingError> {
        let handler = self
            .subscribers
            .get(&subject)
            .ok_or_else(|| MessagingError::NoSubscriber {
                node: self.local.id.clone(),
                subject: subject.clone(),
            })?;
        let message = ClusterMessage::new(self.local.id.clone(), subject, payload);
        if kind == FrameKind::Request {
            let reply = handler.handle(message).await;
            reply
                .map(Some)
                .ok_or_else(|| MessagingError::NoResponse(self.local.id.clone()))
        } else {
            tokio::spawn(async move {
                handler.handle(message).await;
            });
            Ok(None)
        }
    }

    async fn fan_out(&self, subject: MessageSubject, payload: Bytes, include_self: bool) {
        let targets: Vec<NodeId> = self
            .membership
            .nodes()
            .into_iter()
            .map(|n| n.id)
            .filter(|id| include_self || *id != self.local.id)
            .collect();
        let sends = targets.iter().map(|to| {
            let subject = subject.clone();
            let payload = payload.clone();
            async move {
                if let Err(e) = self.deliver(subject.clone(), payload, to, FrameKind::OneWay).await {
                    trace!(to = %to, subject = %subject, error = %e, "Broadcast not delivered");
                }
            }
        });
        futures::future::join_all(sends).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_id: NodeId,
    subscribers: Arc<SubscriberRegistry>,
    max_frame_length: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(%peer, "Accepted cluster connection");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        Framed::new(stream, new_codec(max_frame_length)),
                        local_id.clone(),
                        subscribers.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept cluster connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Cluster accept loop stopped");
}

async fn serve_connection(
    mut conn: Connection,
    local_id: NodeId,
    subscribers: Arc<SubscriberRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = conn.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes.freeze(),
            Some(Err(e)) => {
                debug!(error = %e, "Cluster connection read failed");
                break;
            }
            None => break,
        };
        let (header, payload) = match decode_frame(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable cluster frame");
                break;
            }
        };

        let handler = subscribers.get(&header.subject);
        if handler.is_none() {
            trace!(subject = %header.subject, sender = %header.sender, "No subscriber for subject");
        }
        let message = ClusterMessage::new(header.sender, header.subject.clone(), payload);

        match header.kind {
            FrameKind::OneWay => {
                if let Some(handler) = handler {
                    tokio::spawn(async move {
                        handler.handle(message).await;
                    });
                }
            }
            FrameKind::Request => {
                let reply = match handler {
                    Some(handler) => handler.handle(message).await,
                    None => None,
                };
                let (kind, body) = match reply {
                    Some(body) => (FrameKind::Reply, body),
                    None => (FrameKind::NoReply, Bytes::new()),
                };
                let header = FrameHeader {
                    kind,
                    sender: local_id.clone(),
                    subject: header.subject,
                };
                let sent = match encode_frame(&header, &body) {
                    Ok(frame) => conn.send(frame).await.map_err(MessagingError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    debug!(error = %e, "Failed to send cluster reply");
                    break;
                }
            }
            kind => debug!(?kind, "Ignoring unexpected frame on inbound connection"),
        }
    }
}

#[async_trait]
impl ClusterCommunicator for TcpCommunicator {
    fn local_node(&self) -> &ControllerNode {
        &self.local
    }

    async fn broadcast(&self, subject: MessageSubject, payload: Bytes) -> Result<(), MessagingError> {
        self.fan_out(subject, payload, false).await;
        Ok(())
    }

    async fn broadcast_include_self(
        &self,
        subject: MessageSubject,
        payload: Bytes,
    ) -> Result<(), MessagingError> {
        self.fan_out(subject, payload, true).await;
        Ok(())
    }

    async fn unicast(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<(), MessagingError> {
        self.deliver(subject, payload, to, FrameKind::OneWay).await.map(|_| ())
    }

    async fn send_and_receive(
        &self,
        subject: MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<Bytes, MessagingError> {
        self.deliver(subject, payload, to, FrameKind::Request)
            .await?
            .ok_or_else(|| MessagingError::NoResponse(to.clone()))
    }

    fn add_subscriber(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>) {
        self.subscribers.add(subject, handler);
    }

    fn remove_subscriber(&self, subject: &MessageSubject) {
        self.subscribers.remove(subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let header = FrameHeader {
            kind: FrameKind::Request,
            sender: NodeId::from("n1"),
            subject: MessageSubject::from_static("raft-consensus-ping"),
        };
        let frame = encode_frame(&header, b"payload").unwrap();
        let (decoded, body) = decode_frame(frame).unwrap();
        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.sender, NodeId::from("n1"));
        assert_eq!(body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        assert!(decode_frame(Bytes::from_static(&[0, 0])).is_err());
        assert!(decode_frame(Bytes::from_static(&[0, 0, 0, 9, b'{'])).is_err());
    }
}
