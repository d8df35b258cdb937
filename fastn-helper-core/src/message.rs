//! Requests the host sends and the responses it gets back.

use crate::{ErrorReply, PeerId, PeerInfo, StreamId, SubscriptionId, Upcall};
use bytes::Bytes;

/// A downcall with the sequence number the host chose for it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub seqno: u64,
    #[serde(flatten)]
    pub downcall: Downcall,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Downcall {
    AddStreamHandler {
        protocol: String,
    },
    RemoveStreamHandler {
        protocol: String,
    },
    AddPeer {
        peer: PeerId,
        #[serde(default)]
        addrs: Vec<String>,
    },
    ListPeers,
    Subscribe {
        topic: String,
        /// Lets the host pick the id. Allocated when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    OpenStream {
        peer: PeerId,
        protocol: String,
    },
    SendStream {
        stream_id: StreamId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    CloseStream {
        stream_id: StreamId,
    },
    ResetStream {
        stream_id: StreamId,
    },
    Publish {
        topic: String,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
}

/// The shape of a downcall, and of the successful response it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DowncallKind {
    AddStreamHandler,
    RemoveStreamHandler,
    AddPeer,
    ListPeers,
    Subscribe,
    Unsubscribe,
    OpenStream,
    SendStream,
    CloseStream,
    ResetStream,
    Publish,
}

impl Downcall {
    pub fn kind(&self) -> DowncallKind {
        match self {
            Downcall::AddStreamHandler { .. } => DowncallKind::AddStreamHandler,
            Downcall::RemoveStreamHandler { .. } => DowncallKind::RemoveStreamHandler,
            Downcall::AddPeer { .. } => DowncallKind::AddPeer,
            Downcall::ListPeers => DowncallKind::ListPeers,
            Downcall::Subscribe { .. } => DowncallKind::Subscribe,
            Downcall::Unsubscribe { .. } => DowncallKind::Unsubscribe,
            Downcall::OpenStream { .. } => DowncallKind::OpenStream,
            Downcall::SendStream { .. } => DowncallKind::SendStream,
            Downcall::CloseStream { .. } => DowncallKind::CloseStream,
            Downcall::ResetStream { .. } => DowncallKind::ResetStream,
            Downcall::Publish { .. } => DowncallKind::Publish,
        }
    }
}

/// Successful outcome of a downcall.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DowncallResult {
    AddStreamHandler,
    RemoveStreamHandler,
    AddPeer,
    ListPeers { peers: Vec<PeerInfo> },
    Subscribe { subscription_id: SubscriptionId },
    Unsubscribe,
    OpenStream { stream_id: StreamId, peer: PeerId },
    SendStream,
    CloseStream,
    ResetStream,
    Publish,
}

impl DowncallResult {
    pub fn kind(&self) -> DowncallKind {
        match self {
            DowncallResult::AddStreamHandler => DowncallKind::AddStreamHandler,
            DowncallResult::RemoveStreamHandler => DowncallKind::RemoveStreamHandler,
            DowncallResult::AddPeer => DowncallKind::AddPeer,
            DowncallResult::ListPeers { .. } => DowncallKind::ListPeers,
            DowncallResult::Subscribe { .. } => DowncallKind::Subscribe,
            DowncallResult::Unsubscribe => DowncallKind::Unsubscribe,
            DowncallResult::OpenStream { .. } => DowncallKind::OpenStream,
            DowncallResult::SendStream => DowncallKind::SendStream,
            DowncallResult::CloseStream => DowncallKind::CloseStream,
            DowncallResult::ResetStream => DowncallKind::ResetStream,
            DowncallResult::Publish => DowncallKind::Publish,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub seqno: u64,
    pub result: Result<DowncallResult, ErrorReply>,
}

/// Everything the helper writes to the host: answers and pushes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMessage {
    Response(Response),
    Push(Upcall),
}

/// Serde adapter that carries [`Bytes`] as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine as _;
    use bytes::Bytes;

    pub fn serialize<S: serde::Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
