//! [`Transport`] over iroh.
//!
//! One task accepts connections. Every connection gets a task that accepts
//! its streams, and every stream gets a reader task that forwards what it
//! reads to the helper. Local ids map one to one onto QUIC streams.

use bytes::Bytes;
use fastn_helper_core::{PeerId, StreamId, Transport, TransportError, TransportEvents};
use futures_util::StreamExt;
use iroh::endpoint::{Connection, RecvStream, SendStream, VarInt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio_util::codec::{BytesCodec, FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ACK, MAX_GOSSIP_LEN, MAX_HEADER_LEN, StreamHeader};

#[derive(Clone)]
pub struct IrohTransport {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: iroh::Endpoint,
    events: OnceLock<TransportEvents>,
    connections: tokio::sync::Mutex<HashMap<PeerId, Vec<Connection>>>,
    streams: tokio::sync::Mutex<HashMap<StreamId, Arc<StreamLink>>>,
    topics: tokio::sync::Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

/// Our half of an open stream.
struct StreamLink {
    send: tokio::sync::Mutex<SendStream>,
    reader: CancellationToken,
}

fn network_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

impl IrohTransport {
    pub fn new(endpoint: iroh::Endpoint) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                events: OnceLock::new(),
                connections: Default::default(),
                streams: Default::default(),
                topics: Default::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &iroh::Endpoint {
        &self.inner.endpoint
    }

    pub fn peer_id(&self) -> PeerId {
        crate::peer_id(&self.inner.endpoint.node_id())
    }

    /// Stops accepting, closes every connection and the endpoint. Each
    /// connected peer is reported disconnected.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down transport");
        self.inner.shutdown.cancel();
        let connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();
        for connection in connections {
            connection.close(0u8.into(), b"shutting down");
        }
        self.inner.endpoint.close().await;
    }
}

impl Inner {
    fn events(&self) -> Result<&TransportEvents, TransportError> {
        self.events.get().ok_or(TransportError::Closed)
    }

    async fn connection(&self, peer: PeerId) -> Option<Connection> {
        self.connections
            .lock()
            .await
            .get(&peer)
            .and_then(|connections| connections.first().cloned())
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("accept loop shutting down");
                    break;
                }
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        tracing::info!("endpoint closed");
                        break;
                    };
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.accept_connection(incoming).await {
                            tracing::warn!("incoming connection failed: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn accept_connection(self: Arc<Self>, incoming: iroh::endpoint::Incoming) -> eyre::Result<()> {
        let connection = incoming.await?;
        let peer = crate::peer_id(&connection.remote_node_id()?);
        tracing::debug!(%peer, "accepted connection");
        self.register(peer, connection, Vec::new()).await;
        Ok(())
    }

    /// Tracks a new connection and starts serving it.
    async fn register(self: &Arc<Self>, peer: PeerId, connection: Connection, addrs: Vec<String>) {
        let first = {
            let mut connections = self.connections.lock().await;
            let list = connections.entry(peer).or_default();
            list.push(connection.clone());
            list.len() == 1
        };
        if first {
            if let Ok(events) = self.events() {
                events.peer_connected(peer, addrs).await;
            }
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.serve_connection(peer, connection).await;
        });
    }

    async fn serve_connection(self: Arc<Self>, peer: PeerId, connection: Connection) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                bi = connection.accept_bi() => match bi {
                    Ok((send, recv)) => {
                        let inner = self.clone();
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.accept_stream(peer, connection, send, recv).await {
                                tracing::warn!(%peer, "incoming stream failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(%peer, "connection ended: {e}");
                        break;
                    }
                },
                uni = connection.accept_uni() => match uni {
                    Ok(recv) => {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.accept_gossip(peer, recv).await {
                                tracing::warn!(%peer, "bad gossip: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(%peer, "connection ended: {e}");
                        break;
                    }
                },
            }
        }
        self.unregister(peer, &connection).await;
    }

    async fn unregister(&self, peer: PeerId, connection: &Connection) {
        let last = {
            let mut connections = self.connections.lock().await;
            let Some(list) = connections.get_mut(&peer) else {
                return;
            };
            list.retain(|c| c.stable_id() != connection.stable_id());
            if list.is_empty() {
                connections.remove(&peer);
                true
            } else {
                false
            }
        };
        if last {
            if let Ok(events) = self.events() {
                events.peer_disconnected(peer).await;
            }
        }
    }

    async fn accept_stream(
        self: Arc<Self>,
        peer: PeerId,
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
    ) -> eyre::Result<()> {
        let mut lines = FramedRead::new(recv, LinesCodec::new_with_max_length(MAX_HEADER_LEN));
        let line = lines
            .next()
            .await
            .ok_or_else(|| eyre::eyre!("stream closed before its header"))??;
        let protocol = match StreamHeader::from_line(&line)? {
            StreamHeader::Stream { protocol } => protocol,
            other => return Err(eyre::eyre!("unexpected header on a bi stream: {other:?}")),
        };

        let events = self.events()?.clone();
        let id = events.allocate_stream_id();
        let link = Arc::new(StreamLink {
            send: tokio::sync::Mutex::new(send),
            reader: self.shutdown.child_token(),
        });

        // writes for the new id queue behind the ack
        let mut send = link.send.lock().await;
        self.streams.lock().await.insert(id, link.clone());

        if let Err(e) = events.incoming_stream(id, peer, &protocol).await {
            tracing::debug!(%peer, %protocol, "refusing stream: {e}");
            self.streams.lock().await.remove(&id);
            send.reset(VarInt::from_u32(0)).ok();
            return Ok(());
        }

        if let Err(e) = send.write_all(format!("{ACK}\n").as_bytes()).await {
            drop(send);
            tracing::debug!(%id, "ack failed: {e}");
            self.streams.lock().await.remove(&id);
            events.stream_reset(id).await;
            return Ok(());
        }
        drop(send);

        let frames = lines.map_decoder(|_| BytesCodec::new());
        self.read_stream(id, connection, frames, link.reader.clone())
            .await;
        Ok(())
    }

    /// Forwards everything read from the stream to the helper until the
    /// remote finishes it, reading fails, or our side ended it.
    ///
    /// A read that fails because the whole connection closed is reported as
    /// connection loss, the same thing the peer's disconnect reports for
    /// this stream, so the order in which the two arrive does not matter.
    async fn read_stream(
        self: Arc<Self>,
        id: StreamId,
        connection: Connection,
        mut frames: FramedRead<RecvStream, BytesCodec>,
        cancel: CancellationToken,
    ) {
        let Ok(events) = self.events().cloned() else {
            return;
        };
        loop {
            tokio::select! {
                // our close or reset already told the helper
                _ = cancel.cancelled() => return,
                frame = frames.next() => match frame {
                    Some(Ok(data)) => events.stream_data(id, data.freeze()).await,
                    Some(Err(e)) => {
                        match connection.close_reason() {
                            Some(reason) => {
                                tracing::debug!(%id, "connection gone: {reason}");
                                events.stream_connection_lost(id).await;
                            }
                            None => {
                                tracing::debug!(%id, "read failed: {e}");
                                events.stream_reset(id).await;
                            }
                        }
                        break;
                    }
                    None => {
                        events.stream_closed(id).await;
                        break;
                    }
                },
            }
        }

        if let Some(link) = self.streams.lock().await.remove(&id) {
            link.send.lock().await.finish().ok();
        }
    }

    async fn accept_gossip(&self, peer: PeerId, mut recv: RecvStream) -> eyre::Result<()> {
        let frame = recv.read_to_end(MAX_GOSSIP_LEN).await?;
        let (topic, data) = crate::protocol::parse_gossip_frame(&frame)?;
        if !self.topics.lock().await.contains(&topic) {
            tracing::trace!(%peer, %topic, "gossip for a topic we did not join");
            return Ok(());
        }
        self.events()?.gossip_received(&topic, peer, data).await;
        Ok(())
    }

    async fn take_link(&self, id: StreamId) -> Result<Arc<StreamLink>, TransportError> {
        self.streams
            .lock()
            .await
            .remove(&id)
            .ok_or(TransportError::NoSuchStream(id))
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    fn attach(&self, events: TransportEvents) {
        if self.inner.events.set(events).is_err() {
            tracing::warn!("transport attached twice, keeping the first");
            return;
        }
        tokio::spawn(self.inner.clone().accept_loop());
    }

    async fn connect(&self, peer: PeerId, addrs: &[String]) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.inner.connection(peer).await.is_some() {
            tracing::debug!(%peer, "already connected");
            return Ok(());
        }

        let node_id = crate::node_id(peer).map_err(|_| TransportError::UnknownPeer(peer))?;
        let direct = addrs
            .iter()
            .map(|addr| {
                addr.parse::<std::net::SocketAddr>()
                    .map_err(|_| TransportError::InvalidAddress(addr.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let node_addr = iroh::NodeAddr::new(node_id).with_direct_addresses(direct);

        let connection = self
            .inner
            .endpoint
            .connect(node_addr, crate::ALPN)
            .await
            .map_err(network_error)?;
        self.inner
            .register(peer, connection, addrs.to_vec())
            .await;
        Ok(())
    }

    async fn open_stream(
        &self,
        stream_id: StreamId,
        peer: PeerId,
        protocol: &str,
    ) -> Result<(), TransportError> {
        let connection = self
            .inner
            .connection(peer)
            .await
            .ok_or(TransportError::UnknownPeer(peer))?;
        let rejected = || TransportError::Rejected {
            peer,
            protocol: protocol.to_string(),
        };

        let (mut send, recv) = connection.open_bi().await.map_err(network_error)?;
        let header = StreamHeader::Stream {
            protocol: protocol.to_string(),
        }
        .to_line()
        .map_err(network_error)?;
        send.write_all(header.as_bytes())
            .await
            .map_err(network_error)?;

        let mut lines = FramedRead::new(recv, LinesCodec::new_with_max_length(MAX_HEADER_LEN));
        match lines.next().await {
            Some(Ok(line)) if line == ACK => {}
            Some(Ok(line)) => {
                tracing::warn!(%peer, %protocol, %line, "unexpected answer to stream header");
                return Err(rejected());
            }
            Some(Err(e)) => {
                tracing::debug!(%peer, %protocol, "stream refused: {e}");
                return Err(rejected());
            }
            None => return Err(rejected()),
        }

        let link = Arc::new(StreamLink {
            send: tokio::sync::Mutex::new(send),
            reader: self.inner.shutdown.child_token(),
        });
        self.inner
            .streams
            .lock()
            .await
            .insert(stream_id, link.clone());

        let frames = lines.map_decoder(|_| BytesCodec::new());
        tokio::spawn(
            self.inner
                .clone()
                .read_stream(stream_id, connection, frames, link.reader.clone()),
        );
        Ok(())
    }

    async fn write(&self, stream_id: StreamId, data: Bytes) -> Result<(), TransportError> {
        let link = self
            .inner
            .streams
            .lock()
            .await
            .get(&stream_id)
            .cloned()
            .ok_or(TransportError::NoSuchStream(stream_id))?;
        link.send
            .lock()
            .await
            .write_all(&data)
            .await
            .map_err(network_error)
    }

    async fn close_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        let link = self.inner.take_link(stream_id).await?;
        link.reader.cancel();
        link.send.lock().await.finish().map_err(network_error)
    }

    async fn reset_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        let link = self.inner.take_link(stream_id).await?;
        link.reader.cancel();
        link.send
            .lock()
            .await
            .reset(VarInt::from_u32(0))
            .map_err(network_error)
    }

    async fn join_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.inner.topics.lock().await.insert(topic.to_string());
        Ok(())
    }

    async fn leave_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.inner.topics.lock().await.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let frame = crate::protocol::gossip_frame(topic, &data).map_err(network_error)?;
        let peers: Vec<(PeerId, Connection)> = self
            .inner
            .connections
            .lock()
            .await
            .iter()
            .filter_map(|(peer, list)| list.first().map(|c| (*peer, c.clone())))
            .collect();

        for (peer, connection) in peers {
            let sent = async {
                let mut send = connection.open_uni().await?;
                send.write_all(&frame).await?;
                send.finish()?;
                eyre::Ok(())
            };
            if let Err(e) = sent.await {
                tracing::warn!(%peer, %topic, "gossip not delivered: {e}");
            }
        }
        Ok(())
    }
}
