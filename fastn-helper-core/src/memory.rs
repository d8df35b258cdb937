//! In-process network for tests and local experiments.
//!
//! A [`MemoryNetwork`] is a hub that any number of [`MemoryTransport`] nodes
//! join. Nodes connect to each other by peer id, open streams, and gossip to
//! linked peers that joined the same topic. [`MemoryTransport::disconnect`]
//! and [`MemoryTransport::shutdown`] drop links the way a failing network
//! would.
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let alice = network.node().await;
//! let bob = network.node().await;
//! let (alice_helper, alice_upcalls) = Helper::new(alice.clone(), Default::default());
//! let (bob_helper, bob_upcalls) = Helper::new(bob.clone(), Default::default());
//! alice_helper.add_peer(bob.peer_id(), vec![bob.addr().to_string()]).await?;
//! ```

use crate::{PeerId, StreamId, Transport, TransportError, TransportEvents};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

/// One end of a stream: the node and its local stream id.
type End = (PeerId, StreamId);

#[derive(Default)]
struct Hub {
    next_addr: usize,
    nodes: HashMap<PeerId, Weak<MemoryTransport>>,
    offline: HashSet<PeerId>,
    links: HashSet<(PeerId, PeerId)>,
    topics: HashMap<PeerId, HashSet<String>>,
    streams: HashMap<End, End>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Hub {
    fn events(&self, peer: PeerId) -> Option<TransportEvents> {
        self.nodes
            .get(&peer)?
            .upgrade()?
            .events
            .get()
            .cloned()
    }

    fn addr(&self, peer: PeerId) -> Vec<String> {
        self.nodes
            .get(&peer)
            .and_then(Weak::upgrade)
            .map(|node| vec![node.addr.clone()])
            .unwrap_or_default()
    }

    fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&link(a, b))
    }

    fn peers_of(&self, node: PeerId) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .links
            .iter()
            .filter_map(|&(a, b)| match (a == node, b == node) {
                (true, _) => Some(b),
                (_, true) => Some(a),
                _ => None,
            })
            .collect();
        peers.sort();
        peers
    }

    /// Removes both ends of a stream, returning the remote end.
    fn unlink_stream(&mut self, end: End) -> Option<End> {
        let remote = self.streams.remove(&end)?;
        self.streams.remove(&remote);
        Some(remote)
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<tokio::sync::Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with a random peer id.
    pub async fn node(&self) -> Arc<MemoryTransport> {
        let mut hub = self.hub.lock().await;
        hub.next_addr += 1;
        let node = Arc::new(MemoryTransport {
            peer_id: PeerId::random(),
            addr: format!("/memory/{}", hub.next_addr),
            events: OnceLock::new(),
            network: self.clone(),
        });
        hub.nodes.insert(node.peer_id, Arc::downgrade(&node));
        node
    }
}

pub struct MemoryTransport {
    peer_id: PeerId,
    addr: String,
    events: OnceLock<TransportEvents>,
    network: MemoryNetwork,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("peer_id", &self.peer_id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl MemoryTransport {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Drops the link to `peer`. Both sides see the peer go, then every
    /// stream between them fails.
    pub async fn disconnect(&self, peer: PeerId) {
        let (ours, theirs, broken) = {
            let mut hub = self.network.hub.lock().await;
            if !hub.links.remove(&link(self.peer_id, peer)) {
                return;
            }
            let ends: Vec<End> = hub
                .streams
                .iter()
                .filter(|((a, _), (b, _))| {
                    (*a == self.peer_id && *b == peer) || (*a == peer && *b == self.peer_id)
                })
                .map(|(end, _)| *end)
                .collect();
            let mut broken = Vec::new();
            for end in ends {
                if hub.streams.remove(&end).is_some() {
                    if let Some(events) = hub.events(end.0) {
                        broken.push((events, end.1));
                    }
                }
            }
            (hub.events(self.peer_id), hub.events(peer), broken)
        };
        tracing::debug!(from = %self.peer_id, to = %peer, streams = broken.len(), "link dropped");

        if let Some(events) = ours {
            events.peer_disconnected(peer).await;
        }
        if let Some(events) = theirs {
            events.peer_disconnected(self.peer_id).await;
        }
        for (events, stream_id) in broken {
            events.stream_reset(stream_id).await;
        }
    }

    /// Takes the node off the network, dropping all of its links.
    pub async fn shutdown(&self) {
        let peers = {
            let mut hub = self.network.hub.lock().await;
            hub.offline.insert(self.peer_id);
            hub.peers_of(self.peer_id)
        };
        for peer in peers {
            self.disconnect(peer).await;
        }
    }

    async fn remote(&self, stream_id: StreamId) -> Result<(TransportEvents, StreamId), TransportError> {
        let hub = self.network.hub.lock().await;
        let (peer, remote_id) = *hub
            .streams
            .get(&(self.peer_id, stream_id))
            .ok_or(TransportError::NoSuchStream(stream_id))?;
        let events = hub.events(peer).ok_or(TransportError::UnknownPeer(peer))?;
        Ok((events, remote_id))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn attach(&self, events: TransportEvents) {
        if self.events.set(events).is_err() {
            tracing::warn!(peer = %self.peer_id, "transport attached twice, keeping the first");
        }
    }

    async fn connect(&self, peer: PeerId, _addrs: &[String]) -> Result<(), TransportError> {
        let (ours, theirs, our_addr, their_addr) = {
            let mut hub = self.network.hub.lock().await;
            if hub.offline.contains(&self.peer_id) {
                return Err(TransportError::Closed);
            }
            if peer == self.peer_id || hub.offline.contains(&peer) {
                return Err(TransportError::UnknownPeer(peer));
            }
            let theirs = hub.events(peer).ok_or(TransportError::UnknownPeer(peer))?;
            if !hub.links.insert(link(self.peer_id, peer)) {
                return Ok(());
            }
            (
                hub.events(self.peer_id),
                theirs,
                hub.addr(self.peer_id),
                hub.addr(peer),
            )
        };

        if let Some(ours) = ours {
            ours.peer_connected(peer, their_addr).await;
        }
        theirs.peer_connected(self.peer_id, our_addr).await;
        Ok(())
    }

    async fn open_stream(
        &self,
        stream_id: StreamId,
        peer: PeerId,
        protocol: &str,
    ) -> Result<(), TransportError> {
        let theirs = {
            let hub = self.network.hub.lock().await;
            if !hub.is_linked(self.peer_id, peer) {
                return Err(TransportError::UnknownPeer(peer));
            }
            hub.events(peer).ok_or(TransportError::UnknownPeer(peer))?
        };

        let remote_id = theirs.allocate_stream_id();
        {
            let mut hub = self.network.hub.lock().await;
            hub.streams.insert((self.peer_id, stream_id), (peer, remote_id));
            hub.streams.insert((peer, remote_id), (self.peer_id, stream_id));
        }

        if let Err(e) = theirs.incoming_stream(remote_id, self.peer_id, protocol).await {
            tracing::debug!(%peer, %protocol, "remote refused stream: {e}");
            self.network
                .hub
                .lock()
                .await
                .unlink_stream((self.peer_id, stream_id));
            return Err(TransportError::Rejected {
                peer,
                protocol: protocol.to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, stream_id: StreamId, data: Bytes) -> Result<(), TransportError> {
        let (theirs, remote_id) = self.remote(stream_id).await?;
        theirs.stream_data(remote_id, data).await;
        Ok(())
    }

    async fn close_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        let (theirs, remote_id) = self.remote(stream_id).await?;
        self.network
            .hub
            .lock()
            .await
            .unlink_stream((self.peer_id, stream_id));
        theirs.stream_closed(remote_id).await;
        Ok(())
    }

    async fn reset_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        let (theirs, remote_id) = self.remote(stream_id).await?;
        self.network
            .hub
            .lock()
            .await
            .unlink_stream((self.peer_id, stream_id));
        theirs.stream_reset(remote_id).await;
        Ok(())
    }

    async fn join_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock().await;
        hub.topics
            .entry(self.peer_id)
            .or_default()
            .insert(topic.to_string());
        Ok(())
    }

    async fn leave_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut hub = self.network.hub.lock().await;
        if let Some(topics) = hub.topics.get_mut(&self.peer_id) {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), TransportError> {
        let receivers: Vec<TransportEvents> = {
            let hub = self.network.hub.lock().await;
            if hub.offline.contains(&self.peer_id) {
                return Err(TransportError::Closed);
            }
            hub.peers_of(self.peer_id)
                .into_iter()
                .filter(|peer| hub.topics.get(peer).is_some_and(|t| t.contains(topic)))
                .filter_map(|peer| hub.events(peer))
                .collect()
        };

        for events in receivers {
            events.gossip_received(topic, self.peer_id, data.clone()).await;
        }
        Ok(())
    }
}
