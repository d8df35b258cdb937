//! The single ordered push channel from the helper to the host.
//!
//! Every component that reports something to the host holds an
//! [`UpcallSender`]. The channel is bounded: when the host falls behind,
//! producers wait in [`UpcallSender::emit`]. Nothing is dropped and nothing
//! is reordered, so the events of one source reach the host in the order that
//! source emitted them.

use crate::{PeerId, PeerInfo, StreamId, SubscriptionId};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Push message from the helper to the host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Upcall {
    PeerConnected {
        peer: PeerId,
        addrs: Vec<String>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    IncomingStream {
        stream_id: StreamId,
        peer: PeerInfo,
        protocol: String,
    },
    StreamMessageReceived {
        stream_id: StreamId,
        #[serde(with = "crate::base64_bytes")]
        data: Bytes,
    },
    StreamComplete {
        stream_id: StreamId,
    },
    StreamLost {
        stream_id: StreamId,
        reason: String,
    },
    GossipReceived {
        subscription_id: SubscriptionId,
        sender: PeerId,
        #[serde(with = "crate::base64_bytes")]
        data: Bytes,
    },
}

impl Upcall {
    /// The stream this upcall is about, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Upcall::IncomingStream { stream_id, .. }
            | Upcall::StreamMessageReceived { stream_id, .. }
            | Upcall::StreamComplete { stream_id }
            | Upcall::StreamLost { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}

/// Creates the upcall channel.
pub fn channel(capacity: usize) -> (UpcallSender, UpcallReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (UpcallSender { tx }, UpcallReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct UpcallSender {
    tx: mpsc::Sender<Upcall>,
}

impl UpcallSender {
    /// Queues `upcall`, waiting for room if the host is behind.
    pub async fn emit(&self, upcall: Upcall) {
        tracing::trace!(?upcall, "emitting upcall");
        if let Err(e) = self.tx.send(upcall).await {
            tracing::warn!(upcall = ?e.0, "upcall receiver is gone, dropping upcall");
        }
    }
}

#[derive(Debug)]
pub struct UpcallReceiver {
    rx: mpsc::Receiver<Upcall>,
}

impl UpcallReceiver {
    pub async fn recv(&mut self) -> Option<Upcall> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Upcall> {
        self.rx.try_recv().ok()
    }
}
