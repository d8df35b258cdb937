//! Stream and event multiplexing engine of the fastn P2P helper.
//!
//! The helper daemon embeds a network stack and lets a separate host process
//! drive it. The host sends *downcalls* (open a stream, send bytes, subscribe
//! to a topic, ...) and the daemon reports *upcalls* (peer connected, stream
//! message received, gossip received, ...).
//!
//! This crate holds the part in the middle:
//!
//! - [`PeerTracker`] keeps the connection state of every peer
//! - [`StreamRegistry`] owns every stream record and its state machine
//! - [`SubscriptionTable`] maps subscription ids to gossip topics
//! - [`Dispatcher`] answers every [`Request`] with exactly one [`Response`]
//! - [`UpcallSender`] / [`UpcallReceiver`] form the single ordered push channel
//!
//! The network itself sits behind the [`Transport`] trait. The transport
//! reports what happens on the wire through [`TransportEvents`].
//!
//! ```ignore
//! let (helper, mut upcalls) = fastn_helper_core::Helper::new(transport, Default::default());
//! let dispatcher = fastn_helper_core::Dispatcher::new(helper);
//! let response = dispatcher.dispatch(request).await;
//! while let Some(upcall) = upcalls.recv().await { /* forward to host */ }
//! ```

mod dispatcher;
mod error;
mod gossip;
mod helper;
mod id;
pub mod memory;
mod message;
mod peer;
mod peers;
mod streams;
mod transport;
mod upcall;

#[cfg(test)]
mod test_support;

pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, ErrorReply, HelperError};
pub use gossip::SubscriptionTable;
pub use helper::{Helper, HelperConfig};
pub use id::{IdAllocator, StreamId, SubscriptionId};
pub use message::{
    Downcall, DowncallKind, DowncallResult, HostMessage, Request, Response, base64_bytes,
};
pub use peer::{InvalidPeerId, PeerId, PeerInfo};
pub use peers::{ConnectionState, PeerTracker};
pub use streams::{
    CONNECTION_LOST_REASON, Direction, STREAM_RESET_REASON, StreamRegistry, StreamState,
};
pub use transport::{Transport, TransportError, TransportEvents};
pub use upcall::{Upcall, UpcallReceiver, UpcallSender, channel};

/// Capacity of the upcall channel unless configured otherwise.
pub const DEFAULT_UPCALL_CAPACITY: usize = 256;
