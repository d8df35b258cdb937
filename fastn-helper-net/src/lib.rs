//! iroh transport for the fastn P2P helper.
//!
//! [`IrohTransport`] implements [`fastn_helper_core::Transport`] on top of a
//! single iroh endpoint. Streams and gossip are multiplexed over one QUIC
//! connection per peer; see [`protocol`] for what goes over the wire.

mod endpoint;
pub mod protocol;
mod transport;

pub use endpoint::{EndpointConfig, bind};
pub use protocol::{ACK, ALPN, StreamHeader};
pub use transport::IrohTransport;

/// Converts an iroh node id to the helper's peer id.
pub fn peer_id(node_id: &iroh::NodeId) -> fastn_helper_core::PeerId {
    fastn_helper_core::PeerId::from_bytes(*node_id.as_bytes())
}

/// Converts a peer id to an iroh node id. Fails when the bytes are not a
/// valid Ed25519 point.
pub fn node_id(peer: fastn_helper_core::PeerId) -> eyre::Result<iroh::NodeId> {
    iroh::NodeId::from_bytes(peer.as_bytes()).map_err(|e| eyre::anyhow!("bad peer id {peer}: {e}"))
}
