//! Stream registry and the per-stream state machine.
//!
//! ```text
//!   outbound: Opening ──► Open ──► Closing ──► Completed
//!   inbound:              Open ──► Resetting ─► Lost
//!                          └─────────────────► Completed | Lost
//! ```
//!
//! `Closing` and `Resetting` only exist while a local close or reset is
//! waiting for the transport. A record is removed from the registry the
//! moment it turns terminal, right before its terminal upcall is emitted, so
//! at most one terminal upcall exists per stream.
//!
//! Every record has its own lock. It is taken for state changes and for
//! emitting the record's upcalls, and is never held while waiting on the
//! transport.

use crate::{
    HelperError, IdAllocator, PeerId, PeerInfo, StreamId, Transport, TransportError, Upcall,
    UpcallSender,
};
use bytes::Bytes;
use std::sync::Arc;

/// Reason carried by `StreamLost` for an explicit reset and for any other
/// read failure.
pub const STREAM_RESET_REASON: &str = "read failure: stream reset";

/// Reason carried by `StreamLost` when the stream dies with its connection.
pub const CONNECTION_LOST_REASON: &str = "connection lost: peer disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    Closing,
    Resetting,
    Completed,
    Lost,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Lost)
    }
}

/// Something the transport reported about a stream.
#[derive(Debug)]
enum StreamEvent {
    Data(Bytes),
    RemoteClose,
    RemoteReset,
    PeerLost,
}

#[derive(Debug)]
struct StreamRecord {
    state: StreamState,
    /// Events that arrived while the stream was still `Opening`.
    pending: Vec<StreamEvent>,
}

#[derive(Debug)]
struct StreamSlot {
    id: StreamId,
    peer: PeerId,
    protocol: String,
    direction: Direction,
    record: tokio::sync::Mutex<StreamRecord>,
}

impl StreamSlot {
    fn new(
        id: StreamId,
        peer: PeerId,
        protocol: String,
        direction: Direction,
        state: StreamState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            protocol,
            direction,
            record: tokio::sync::Mutex::new(StreamRecord {
                state,
                pending: Vec::new(),
            }),
        })
    }
}

pub struct StreamRegistry {
    ids: IdAllocator,
    streams: scc::HashMap<StreamId, Arc<StreamSlot>>,
    handlers: scc::HashSet<String>,
    transport: Arc<dyn Transport>,
    upcalls: UpcallSender,
}

impl StreamRegistry {
    pub fn new(transport: Arc<dyn Transport>, upcalls: UpcallSender) -> Self {
        Self {
            ids: IdAllocator::new(),
            streams: scc::HashMap::new(),
            handlers: scc::HashSet::new(),
            transport,
            upcalls,
        }
    }

    pub(crate) fn allocate_id(&self) -> StreamId {
        StreamId(self.ids.next())
    }

    pub async fn add_handler(&self, protocol: String) -> Result<(), HelperError> {
        self.handlers
            .insert_async(protocol)
            .await
            .map_err(HelperError::HandlerExists)?;
        Ok(())
    }

    /// Stops accepting new streams for `protocol`. Open streams stay open.
    pub async fn remove_handler(&self, protocol: &str) -> Result<(), HelperError> {
        match self.handlers.remove_async(protocol).await {
            Some(_) => Ok(()),
            None => Err(HelperError::UnknownHandler(protocol.to_string())),
        }
    }

    pub async fn has_handler(&self, protocol: &str) -> bool {
        self.handlers.contains_async(protocol).await
    }

    /// Current state of a live stream. `None` once it is gone.
    pub async fn state(&self, stream_id: StreamId) -> Option<StreamState> {
        let slot = self.get(stream_id).await?;
        let record = slot.record.lock().await;
        Some(record.state)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    async fn get(&self, stream_id: StreamId) -> Option<Arc<StreamSlot>> {
        self.streams
            .read_async(&stream_id, |_, slot| slot.clone())
            .await
    }

    async fn insert(&self, slot: Arc<StreamSlot>) {
        let id = slot.id;
        if self.streams.insert_async(id, slot).await.is_err() {
            panic!("stream id {id} handed out twice");
        }
    }

    /// Opens a stream to `peer` and returns its id once the transport
    /// confirmed it. No upcall is emitted for a failed open.
    #[tracing::instrument(skip(self))]
    pub async fn open_outbound(
        &self,
        peer: PeerId,
        protocol: String,
    ) -> Result<StreamId, HelperError> {
        let id = self.allocate_id();
        let slot = StreamSlot::new(
            id,
            peer,
            protocol.clone(),
            Direction::Outbound,
            StreamState::Opening,
        );
        self.insert(slot.clone()).await;

        let opened = self.transport.open_stream(id, peer, &protocol).await;

        let mut record = slot.record.lock().await;
        assert_eq!(
            record.state,
            StreamState::Opening,
            "stream {id} left Opening before its open completed"
        );

        if let Err(source) = opened {
            self.streams.remove_async(&id).await;
            tracing::debug!(
                %id,
                dropped = record.pending.len(),
                "open failed: {source}"
            );
            return Err(HelperError::StreamOpenFailed {
                peer,
                protocol,
                source,
            });
        }

        record.state = StreamState::Open;
        tracing::debug!(%id, "stream open");
        for event in std::mem::take(&mut record.pending) {
            self.apply(&slot, &mut record.state, event).await;
        }
        Ok(id)
    }

    /// Registers a stream the remote opened under the id reserved through
    /// `allocate_id`, and tells the host about it.
    pub async fn on_incoming(
        &self,
        id: StreamId,
        peer: PeerInfo,
        protocol: String,
    ) -> Result<(), HelperError> {
        if !self.has_handler(&protocol).await {
            tracing::debug!(%id, %protocol, peer = %peer.peer, "no handler, refusing stream");
            return Err(HelperError::UnknownHandler(protocol));
        }

        let slot = StreamSlot::new(
            id,
            peer.peer,
            protocol.clone(),
            Direction::Inbound,
            StreamState::Open,
        );
        // locked before it becomes visible so IncomingStream is the first
        // upcall for this id
        let _record = slot.record.lock().await;
        self.insert(slot.clone()).await;
        tracing::debug!(%id, %protocol, peer = %peer.peer, "incoming stream");
        self.upcalls
            .emit(Upcall::IncomingStream {
                stream_id: id,
                peer,
                protocol,
            })
            .await;
        Ok(())
    }

    pub async fn send(&self, id: StreamId, data: Bytes) -> Result<(), HelperError> {
        let slot = self.get(id).await.ok_or(HelperError::UnknownStream(id))?;
        if slot.record.lock().await.state != StreamState::Open {
            return Err(HelperError::UnknownStream(id));
        }

        self.transport
            .write(id, data)
            .await
            .map_err(|e| match e {
                TransportError::NoSuchStream(_) => HelperError::UnknownStream(id),
                e => e.into(),
            })
    }

    /// Graceful close. Emits `StreamComplete` for our side once the
    /// transport confirmed the close.
    pub async fn close(&self, id: StreamId) -> Result<(), HelperError> {
        let slot = self.get(id).await.ok_or(HelperError::UnknownStream(id))?;
        {
            let mut record = slot.record.lock().await;
            if record.state != StreamState::Open {
                return Err(HelperError::UnknownStream(id));
            }
            record.state = StreamState::Closing;
        }

        let closed = self.transport.close_stream(id).await;

        let mut record = slot.record.lock().await;
        match (record.state, closed) {
            (StreamState::Closing, Ok(())) => {
                self.terminate(&slot, &mut record.state, StreamState::Completed, None)
                    .await;
                Ok(())
            }
            (StreamState::Closing, Err(e)) => {
                tracing::warn!(%id, "close failed: {e}");
                record.state = StreamState::Open;
                Err(e.into())
            }
            (state, _) => {
                // a remote event finished the stream while we were closing
                tracing::debug!(%id, ?state, "stream ended during close");
                Ok(())
            }
        }
    }

    /// Abrupt reset. Always ends the stream with `StreamLost`, even when the
    /// transport could not deliver the reset.
    pub async fn reset(&self, id: StreamId) -> Result<(), HelperError> {
        let slot = self.get(id).await.ok_or(HelperError::UnknownStream(id))?;
        {
            let mut record = slot.record.lock().await;
            if record.state != StreamState::Open {
                return Err(HelperError::UnknownStream(id));
            }
            record.state = StreamState::Resetting;
        }

        if let Err(e) = self.transport.reset_stream(id).await {
            tracing::warn!(%id, "reset not delivered: {e}");
        }

        let mut record = slot.record.lock().await;
        self.terminate(
            &slot,
            &mut record.state,
            StreamState::Lost,
            Some(STREAM_RESET_REASON),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn on_data(&self, id: StreamId, data: Bytes) {
        self.deliver(id, StreamEvent::Data(data)).await
    }

    pub(crate) async fn on_remote_close(&self, id: StreamId) {
        self.deliver(id, StreamEvent::RemoteClose).await
    }

    pub(crate) async fn on_remote_reset(&self, id: StreamId) {
        self.deliver(id, StreamEvent::RemoteReset).await
    }

    /// The stream's connection went away. Same outcome as losing the peer,
    /// whichever of the two the transport reports first.
    pub(crate) async fn on_connection_lost(&self, id: StreamId) {
        self.deliver(id, StreamEvent::PeerLost).await
    }

    /// Ends every stream of `peer`. Called by the peer tracker, with the
    /// peer's record locked, when the connection goes away.
    pub(crate) async fn on_peer_disconnected(&self, peer: PeerId) {
        let mut affected = Vec::new();
        self.streams
            .scan_async(|_, slot| {
                if slot.peer == peer {
                    affected.push(slot.clone());
                }
            })
            .await;
        affected.sort_by_key(|slot| slot.id);

        tracing::debug!(%peer, count = affected.len(), "peer gone, ending its streams");
        for slot in affected {
            let mut record = slot.record.lock().await;
            if record.state == StreamState::Opening {
                record.pending.push(StreamEvent::PeerLost);
            } else {
                self.apply(&slot, &mut record.state, StreamEvent::PeerLost)
                    .await;
            }
        }
    }

    async fn deliver(&self, id: StreamId, event: StreamEvent) {
        let Some(slot) = self.get(id).await else {
            // raced with a local close or reset
            tracing::debug!(%id, ?event, "event for a finished stream, dropping");
            return;
        };

        let mut record = slot.record.lock().await;
        if record.state == StreamState::Opening {
            record.pending.push(event);
            return;
        }
        self.apply(&slot, &mut record.state, event).await;
    }

    /// Applies a transport event to a stream that is past `Opening`. Caller
    /// holds the record lock.
    async fn apply(&self, slot: &StreamSlot, state: &mut StreamState, event: StreamEvent) {
        match (*state, event) {
            (StreamState::Open | StreamState::Closing, StreamEvent::Data(data)) => {
                tracing::trace!(id = %slot.id, len = data.len(), "stream data");
                self.upcalls
                    .emit(Upcall::StreamMessageReceived {
                        stream_id: slot.id,
                        data,
                    })
                    .await;
            }
            (StreamState::Open | StreamState::Closing, StreamEvent::RemoteClose) => {
                self.terminate(slot, state, StreamState::Completed, None)
                    .await;
            }
            (StreamState::Open | StreamState::Closing, StreamEvent::RemoteReset) => {
                self.terminate(slot, state, StreamState::Lost, Some(STREAM_RESET_REASON))
                    .await;
            }
            (StreamState::Open | StreamState::Closing, StreamEvent::PeerLost) => {
                self.terminate(slot, state, StreamState::Lost, Some(CONNECTION_LOST_REASON))
                    .await;
            }
            (current, event) => {
                tracing::debug!(id = %slot.id, state = ?current, ?event, "ignoring stream event");
            }
        }
    }

    /// Moves a stream into a terminal state, drops it from the registry and
    /// emits its terminal upcall. Caller holds the record lock.
    async fn terminate(
        &self,
        slot: &StreamSlot,
        state: &mut StreamState,
        terminal: StreamState,
        reason: Option<&str>,
    ) {
        assert!(terminal.is_terminal());
        assert!(!state.is_terminal(), "stream {} terminated twice", slot.id);

        *state = terminal;
        self.streams.remove_async(&slot.id).await;
        tracing::debug!(
            id = %slot.id,
            peer = %slot.peer,
            protocol = %slot.protocol,
            direction = ?slot.direction,
            state = ?terminal,
            "stream finished"
        );

        let upcall = match reason {
            None => Upcall::StreamComplete { stream_id: slot.id },
            Some(reason) => Upcall::StreamLost {
                stream_id: slot.id,
                reason: reason.to_string(),
            },
        };
        self.upcalls.emit(upcall).await;
    }
}
