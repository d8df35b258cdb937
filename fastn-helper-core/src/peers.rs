//! Peer connection tracker.
//!
//! One record per peer ever seen, each behind its own lock. Connect and
//! disconnect events are idempotent: the host hears about a state change
//! once, no matter how many times the transport repeats it.

use crate::{
    HelperError, PeerId, PeerInfo, StreamRegistry, Transport, Upcall, UpcallSender,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug)]
struct PeerConnection {
    addrs: Vec<String>,
    state: ConnectionState,
}

type PeerSlot = Arc<tokio::sync::Mutex<PeerConnection>>;

pub struct PeerTracker {
    peers: scc::HashMap<PeerId, PeerSlot>,
    streams: Arc<StreamRegistry>,
    transport: Arc<dyn Transport>,
    upcalls: UpcallSender,
}

impl PeerTracker {
    pub fn new(
        streams: Arc<StreamRegistry>,
        transport: Arc<dyn Transport>,
        upcalls: UpcallSender,
    ) -> Self {
        Self {
            peers: scc::HashMap::new(),
            streams,
            transport,
            upcalls,
        }
    }

    async fn slot(&self, peer: PeerId) -> PeerSlot {
        self.peers
            .entry_async(peer)
            .await
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(PeerConnection {
                    addrs: Vec::new(),
                    state: ConnectionState::Disconnected,
                }))
            })
            .get()
            .clone()
    }

    async fn existing(&self, peer: PeerId) -> Option<PeerSlot> {
        self.peers.read_async(&peer, |_, slot| slot.clone()).await
    }

    /// Asks the transport to connect. `PeerConnected` follows separately once
    /// the connection is up.
    pub async fn request_connect(
        &self,
        peer: PeerId,
        addrs: Vec<String>,
    ) -> Result<(), HelperError> {
        tracing::debug!(%peer, ?addrs, "connecting");
        self.transport.connect(peer, &addrs).await?;
        Ok(())
    }

    pub async fn on_connect(&self, peer: PeerId, addrs: Vec<String>) {
        let slot = self.slot(peer).await;
        let mut connection = slot.lock().await;
        if connection.state == ConnectionState::Connected {
            tracing::trace!(%peer, "already connected");
            return;
        }

        connection.state = ConnectionState::Connected;
        connection.addrs = addrs.clone();
        tracing::info!(%peer, "peer connected");
        self.upcalls
            .emit(Upcall::PeerConnected { peer, addrs })
            .await;
    }

    /// Marks the peer gone and ends every stream it had. The peer's record
    /// stays locked until all of those streams are ended.
    pub async fn on_disconnect(&self, peer: PeerId) {
        let Some(slot) = self.existing(peer).await else {
            tracing::trace!(%peer, "disconnect for a peer never seen");
            return;
        };
        let mut connection = slot.lock().await;
        if connection.state != ConnectionState::Connected {
            tracing::trace!(%peer, "already disconnected");
            return;
        }

        connection.state = ConnectionState::Disconnected;
        tracing::info!(%peer, "peer disconnected");
        self.upcalls.emit(Upcall::PeerDisconnected { peer }).await;
        self.streams.on_peer_disconnected(peer).await;
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        match self.existing(peer).await {
            Some(slot) => slot.lock().await.state == ConnectionState::Connected,
            None => false,
        }
    }

    /// Addresses the peer connected from, empty if unknown.
    pub async fn addrs(&self, peer: PeerId) -> Vec<String> {
        match self.existing(peer).await {
            Some(slot) => slot.lock().await.addrs.clone(),
            None => Vec::new(),
        }
    }

    /// Every currently connected peer, ordered by id.
    pub async fn connected(&self) -> Vec<PeerInfo> {
        let mut slots = Vec::new();
        self.peers
            .scan_async(|peer, slot| slots.push((*peer, slot.clone())))
            .await;
        slots.sort_by_key(|(peer, _)| *peer);

        let mut connected = Vec::new();
        for (peer, slot) in slots {
            let connection = slot.lock().await;
            if connection.state == ConnectionState::Connected {
                connected.push(PeerInfo {
                    peer,
                    addrs: connection.addrs.clone(),
                });
            }
        }
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, StubTransport, peer};
    use crate::{CONNECTION_LOST_REASON, StreamState};

    fn tracker() -> (
        Arc<StubTransport>,
        Arc<StreamRegistry>,
        PeerTracker,
        crate::UpcallReceiver,
    ) {
        let transport = Arc::new(StubTransport::default());
        let (tx, rx) = crate::channel(16);
        let streams = Arc::new(StreamRegistry::new(transport.clone(), tx.clone()));
        let tracker = PeerTracker::new(streams.clone(), transport.clone(), tx);
        (transport, streams, tracker, rx)
    }

    #[tokio::test]
    async fn test_double_connect_emits_once() {
        let (_transport, _streams, tracker, mut rx) = tracker();
        let addrs = vec!["/memory/1".to_string()];

        tracker.on_connect(peer(1), addrs.clone()).await;
        tracker.on_connect(peer(1), addrs.clone()).await;

        assert_eq!(
            rx.try_recv(),
            Some(Upcall::PeerConnected {
                peer: peer(1),
                addrs
            })
        );
        assert!(rx.try_recv().is_none());
        assert!(tracker.is_connected(peer(1)).await);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_ignores_strangers() {
        let (_transport, _streams, tracker, mut rx) = tracker();
        tracker.on_disconnect(peer(9)).await;
        assert!(rx.try_recv().is_none());

        tracker.on_connect(peer(1), vec![]).await;
        rx.try_recv();
        tracker.on_disconnect(peer(1)).await;
        tracker.on_disconnect(peer(1)).await;
        assert_eq!(
            rx.try_recv(),
            Some(Upcall::PeerDisconnected { peer: peer(1) })
        );
        assert!(rx.try_recv().is_none());
        assert!(!tracker.is_connected(peer(1)).await);
    }

    #[tokio::test]
    async fn test_reconnect_is_reported_again() {
        let (_transport, _streams, tracker, mut rx) = tracker();
        tracker.on_connect(peer(1), vec![]).await;
        tracker.on_disconnect(peer(1)).await;
        tracker.on_connect(peer(1), vec!["/memory/7".into()]).await;

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(tracker.addrs(peer(1)).await, vec!["/memory/7".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_open_streams() {
        let (_transport, streams, tracker, mut rx) = tracker();
        tracker.on_connect(peer(1), vec![]).await;
        let id = streams.open_outbound(peer(1), "p".into()).await.unwrap();
        rx.try_recv();

        tracker.on_disconnect(peer(1)).await;
        assert_eq!(
            rx.try_recv(),
            Some(Upcall::PeerDisconnected { peer: peer(1) })
        );
        assert_eq!(
            rx.try_recv(),
            Some(Upcall::StreamLost {
                stream_id: id,
                reason: CONNECTION_LOST_REASON.to_string(),
            })
        );
        assert_eq!(streams.state(id).await, None::<StreamState>);
    }

    #[tokio::test]
    async fn test_connect_goes_through_transport() {
        let (transport, _streams, tracker, mut rx) = tracker();
        tracker
            .request_connect(peer(2), vec!["127.0.0.1:4000".into()])
            .await
            .unwrap();
        assert_eq!(transport.calls(), vec![Call::Connect(peer(2))]);
        // the upcall only comes from the transport's event
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lists_connected_peers() {
        let (_transport, _streams, tracker, _rx) = tracker();
        tracker.on_connect(peer(2), vec!["b".into()]).await;
        tracker.on_connect(peer(1), vec!["a".into()]).await;
        tracker.on_connect(peer(3), vec![]).await;
        tracker.on_disconnect(peer(3)).await;

        let peers: Vec<_> = tracker.connected().await;
        assert_eq!(
            peers,
            vec![
                PeerInfo {
                    peer: peer(1),
                    addrs: vec!["a".into()]
                },
                PeerInfo {
                    peer: peer(2),
                    addrs: vec!["b".into()]
                },
            ]
        );
    }
}
