//! The seam between the helper and the network.
//!
//! The helper calls into a [`Transport`] to make things happen on the wire,
//! and the transport reports what the wire did through the
//! [`TransportEvents`] handle it receives in [`Transport::attach`].

use crate::{
    HelperError, PeerId, PeerInfo, PeerTracker, StreamId, StreamRegistry, SubscriptionTable,
};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    UnknownPeer(PeerId),

    #[error("no such stream {0}")]
    NoSuchStream(StreamId),

    #[error("{peer} does not accept {protocol} streams")]
    Rejected { peer: PeerId, protocol: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("network error: {0}")]
    Io(String),

    #[error("transport is shut down")]
    Closed,
}

/// Operations the helper needs from the network.
///
/// Stream ids passed in are always the local ids the helper allocated. The
/// transport keeps whatever mapping it needs to the wire-level stream.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hands the transport the sink for everything it observes. Called once,
    /// before any other method.
    fn attach(&self, events: TransportEvents);

    /// Establishes a connection. Success is reported separately through
    /// [`TransportEvents::peer_connected`].
    async fn connect(&self, peer: PeerId, addrs: &[String]) -> Result<(), TransportError>;

    /// Opens a stream and returns once the remote accepted it.
    async fn open_stream(
        &self,
        stream_id: StreamId,
        peer: PeerId,
        protocol: &str,
    ) -> Result<(), TransportError>;

    async fn write(&self, stream_id: StreamId, data: Bytes) -> Result<(), TransportError>;

    /// Graceful close of our side of the stream.
    async fn close_stream(&self, stream_id: StreamId) -> Result<(), TransportError>;

    /// Abrupt reset of both directions.
    async fn reset_stream(&self, stream_id: StreamId) -> Result<(), TransportError>;

    async fn join_topic(&self, topic: &str) -> Result<(), TransportError>;

    async fn leave_topic(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), TransportError>;
}

/// Where a transport reports network events.
///
/// Cheap to clone; every connection and stream reader task can hold its own.
#[derive(Clone)]
pub struct TransportEvents {
    peers: Arc<PeerTracker>,
    streams: Arc<StreamRegistry>,
    subscriptions: Arc<SubscriptionTable>,
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents").finish_non_exhaustive()
    }
}

impl TransportEvents {
    pub(crate) fn new(
        peers: Arc<PeerTracker>,
        streams: Arc<StreamRegistry>,
        subscriptions: Arc<SubscriptionTable>,
    ) -> Self {
        Self {
            peers,
            streams,
            subscriptions,
        }
    }

    pub async fn peer_connected(&self, peer: PeerId, addrs: Vec<String>) {
        self.peers.on_connect(peer, addrs).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        self.peers.on_disconnect(peer).await
    }

    /// Reserves the local id for a stream the remote is opening.
    ///
    /// The transport registers the stream under this id before calling
    /// [`Self::incoming_stream`], so writes for it work as soon as the host
    /// learns about it.
    pub fn allocate_stream_id(&self) -> StreamId {
        self.streams.allocate_id()
    }

    /// A remote opened a stream. Fails when nobody handles `protocol`; the
    /// transport should then refuse the stream.
    pub async fn incoming_stream(
        &self,
        stream_id: StreamId,
        peer: PeerId,
        protocol: &str,
    ) -> Result<(), HelperError> {
        let addrs = self.peers.addrs(peer).await;
        self.streams
            .on_incoming(stream_id, PeerInfo { peer, addrs }, protocol.to_string())
            .await
    }

    pub async fn stream_data(&self, stream_id: StreamId, data: Bytes) {
        self.streams.on_data(stream_id, data).await
    }

    /// The remote finished its side of the stream.
    pub async fn stream_closed(&self, stream_id: StreamId) {
        self.streams.on_remote_close(stream_id).await
    }

    /// Reading from the stream failed, usually because it was reset.
    pub async fn stream_reset(&self, stream_id: StreamId) {
        self.streams.on_remote_reset(stream_id).await
    }

    /// Reading failed because the stream's whole connection closed.
    pub async fn stream_connection_lost(&self, stream_id: StreamId) {
        self.streams.on_connection_lost(stream_id).await
    }

    pub async fn gossip_received(&self, topic: &str, sender: PeerId, data: Bytes) {
        self.subscriptions
            .on_gossip_received(topic, sender, data)
            .await
    }
}
