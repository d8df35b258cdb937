//! Errors a downcall can fail with

use crate::{PeerId, StreamId, SubscriptionId, TransportError};

/// Why a downcall failed.
///
/// Every variant ends up in the error response of the request that caused it.
/// Failures that happen later on the network never show up here; they arrive
/// as `StreamLost` or `PeerDisconnected` upcalls.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("failed to open {protocol} stream to {peer}: {source}")]
    StreamOpenFailed {
        peer: PeerId,
        protocol: String,
        #[source]
        source: TransportError,
    },

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("a stream handler for {0} is already registered")]
    HandlerExists(String),

    #[error("no stream handler registered for {0}")]
    UnknownHandler(String),

    #[error("subscription {0} already exists")]
    SubscriptionExists(SubscriptionId),

    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("request {0} is already in flight")]
    DuplicateSequence(u64),
}

/// Machine readable error category sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnknownStream,
    UnknownPeer,
    StreamOpenFailed,
    Transport,
    HandlerExists,
    UnknownHandler,
    SubscriptionExists,
    UnknownSubscription,
    DuplicateSequence,
    InvalidRequest,
}

impl HelperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HelperError::UnknownStream(_) => ErrorKind::UnknownStream,
            HelperError::UnknownPeer(_) => ErrorKind::UnknownPeer,
            HelperError::StreamOpenFailed { .. } => ErrorKind::StreamOpenFailed,
            HelperError::Transport { .. } => ErrorKind::Transport,
            HelperError::HandlerExists(_) => ErrorKind::HandlerExists,
            HelperError::UnknownHandler(_) => ErrorKind::UnknownHandler,
            HelperError::SubscriptionExists(_) => ErrorKind::SubscriptionExists,
            HelperError::UnknownSubscription(_) => ErrorKind::UnknownSubscription,
            HelperError::DuplicateSequence(_) => ErrorKind::DuplicateSequence,
        }
    }
}

/// Error half of a [`crate::Response`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: message.into(),
        }
    }
}

impl From<&HelperError> for ErrorReply {
    fn from(error: &HelperError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<HelperError> for ErrorReply {
    fn from(error: HelperError) -> Self {
        Self::from(&error)
    }
}
