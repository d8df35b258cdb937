use crate::{
    Downcall, DowncallResult, HelperError, PeerId, PeerInfo, PeerTracker, StreamId,
    StreamRegistry, SubscriptionId, SubscriptionTable, Transport, TransportEvents, UpcallReceiver,
};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// How many upcalls may queue up before producers wait for the host.
    /// Zero is taken as one.
    pub upcall_capacity: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            upcall_capacity: crate::DEFAULT_UPCALL_CAPACITY,
        }
    }
}

/// The helper engine: all registries wired to one transport and one upcall
/// channel.
#[derive(Clone)]
pub struct Helper {
    inner: Arc<Inner>,
}

struct Inner {
    peers: Arc<PeerTracker>,
    streams: Arc<StreamRegistry>,
    subscriptions: Arc<SubscriptionTable>,
}

impl Helper {
    /// Builds the engine and attaches it to `transport`. The returned
    /// receiver is the only way upcalls leave the helper.
    pub fn new(transport: Arc<dyn Transport>, config: HelperConfig) -> (Self, UpcallReceiver) {
        let (upcalls, receiver) = crate::channel(config.upcall_capacity.max(1));

        let streams = Arc::new(StreamRegistry::new(transport.clone(), upcalls.clone()));
        let peers = Arc::new(PeerTracker::new(
            streams.clone(),
            transport.clone(),
            upcalls.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionTable::new(transport.clone(), upcalls));
        let events = TransportEvents::new(peers.clone(), streams.clone(), subscriptions.clone());
        transport.attach(events);

        let helper = Self {
            inner: Arc::new(Inner {
                peers,
                streams,
                subscriptions,
            }),
        };
        (helper, receiver)
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.inner.streams
    }

    pub async fn add_stream_handler(&self, protocol: String) -> Result<(), HelperError> {
        self.inner.streams.add_handler(protocol).await
    }

    pub async fn remove_stream_handler(&self, protocol: &str) -> Result<(), HelperError> {
        self.inner.streams.remove_handler(protocol).await
    }

    pub async fn add_peer(&self, peer: PeerId, addrs: Vec<String>) -> Result<(), HelperError> {
        self.inner.peers.request_connect(peer, addrs).await
    }

    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.connected().await
    }

    pub async fn subscribe(
        &self,
        topic: String,
        requested: Option<SubscriptionId>,
    ) -> Result<SubscriptionId, HelperError> {
        self.inner.subscriptions.subscribe(topic, requested).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), HelperError> {
        self.inner.subscriptions.unsubscribe(id).await
    }

    /// Opens a stream to a connected peer.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: String,
    ) -> Result<StreamId, HelperError> {
        if !self.inner.peers.is_connected(peer).await {
            return Err(HelperError::UnknownPeer(peer));
        }
        self.inner.streams.open_outbound(peer, protocol).await
    }

    pub async fn send_stream(&self, id: StreamId, data: Bytes) -> Result<(), HelperError> {
        self.inner.streams.send(id, data).await
    }

    pub async fn close_stream(&self, id: StreamId) -> Result<(), HelperError> {
        self.inner.streams.close(id).await
    }

    pub async fn reset_stream(&self, id: StreamId) -> Result<(), HelperError> {
        self.inner.streams.reset(id).await
    }

    pub async fn publish(&self, topic: &str, data: Bytes) -> Result<(), HelperError> {
        self.inner.subscriptions.publish(topic, data).await
    }

    /// Runs one downcall to completion.
    pub async fn execute(&self, downcall: Downcall) -> Result<DowncallResult, HelperError> {
        Ok(match downcall {
            Downcall::AddStreamHandler { protocol } => {
                self.add_stream_handler(protocol).await?;
                DowncallResult::AddStreamHandler
            }
            Downcall::RemoveStreamHandler { protocol } => {
                self.remove_stream_handler(&protocol).await?;
                DowncallResult::RemoveStreamHandler
            }
            Downcall::AddPeer { peer, addrs } => {
                self.add_peer(peer, addrs).await?;
                DowncallResult::AddPeer
            }
            Downcall::ListPeers => DowncallResult::ListPeers {
                peers: self.list_peers().await,
            },
            Downcall::Subscribe {
                topic,
                subscription_id,
            } => DowncallResult::Subscribe {
                subscription_id: self.subscribe(topic, subscription_id).await?,
            },
            Downcall::Unsubscribe { subscription_id } => {
                self.unsubscribe(subscription_id).await?;
                DowncallResult::Unsubscribe
            }
            Downcall::OpenStream { peer, protocol } => DowncallResult::OpenStream {
                stream_id: self.open_stream(peer, protocol).await?,
                peer,
            },
            Downcall::SendStream { stream_id, data } => {
                self.send_stream(stream_id, data).await?;
                DowncallResult::SendStream
            }
            Downcall::CloseStream { stream_id } => {
                self.close_stream(stream_id).await?;
                DowncallResult::CloseStream
            }
            Downcall::ResetStream { stream_id } => {
                self.reset_stream(stream_id).await?;
                DowncallResult::ResetStream
            }
            Downcall::Publish { topic, data } => {
                self.publish(&topic, data).await?;
                DowncallResult::Publish
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubTransport, peer};
    use crate::Upcall;

    #[tokio::test]
    async fn test_open_needs_connected_peer() {
        let transport = Arc::new(StubTransport::default());
        let (helper, mut upcalls) = Helper::new(transport.clone(), HelperConfig::default());

        assert!(matches!(
            helper.open_stream(peer(1), "/mina/97".into()).await,
            Err(HelperError::UnknownPeer(_))
        ));

        transport.events().peer_connected(peer(1), vec![]).await;
        assert!(matches!(
            upcalls.recv().await,
            Some(Upcall::PeerConnected { .. })
        ));
        let id = helper
            .open_stream(peer(1), "/mina/97".into())
            .await
            .unwrap();
        assert_eq!(helper.streams().len(), 1);
        helper.close_stream(id).await.unwrap();
        assert_eq!(
            upcalls.recv().await,
            Some(Upcall::StreamComplete { stream_id: id })
        );
    }

    #[tokio::test]
    async fn test_incoming_stream_carries_peer_addrs() {
        let transport = Arc::new(StubTransport::default());
        let (helper, mut upcalls) = Helper::new(transport.clone(), HelperConfig::default());
        helper.add_stream_handler("/mina/97".into()).await.unwrap();

        let events = transport.events();
        events
            .peer_connected(peer(2), vec!["/memory/2".into()])
            .await;
        upcalls.recv().await;

        let id = events.allocate_stream_id();
        events.incoming_stream(id, peer(2), "/mina/97").await.unwrap();
        assert_eq!(
            upcalls.recv().await,
            Some(Upcall::IncomingStream {
                stream_id: id,
                peer: PeerInfo {
                    peer: peer(2),
                    addrs: vec!["/memory/2".into()],
                },
                protocol: "/mina/97".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_execute_maps_each_downcall() {
        let transport = Arc::new(StubTransport::default());
        let (helper, _upcalls) = Helper::new(transport, HelperConfig::default());

        let result = helper
            .execute(Downcall::Subscribe {
                topic: "test".into(),
                subscription_id: Some(SubscriptionId(123)),
            })
            .await
            .unwrap();
        assert_eq!(
            result,
            DowncallResult::Subscribe {
                subscription_id: SubscriptionId(123)
            }
        );

        let result = helper.execute(Downcall::ListPeers).await.unwrap();
        assert_eq!(result, DowncallResult::ListPeers { peers: vec![] });

        let err = helper
            .execute(Downcall::CloseStream {
                stream_id: StreamId(5),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HelperError::UnknownStream(StreamId(5))));
    }

    #[tokio::test]
    async fn test_zero_upcall_capacity_still_delivers() {
        let transport = Arc::new(StubTransport::default());
        let (_helper, mut upcalls) = Helper::new(
            transport.clone(),
            HelperConfig { upcall_capacity: 0 },
        );

        transport.events().peer_connected(peer(1), vec![]).await;
        assert!(matches!(
            upcalls.recv().await,
            Some(Upcall::PeerConnected { .. })
        ));
    }
}
