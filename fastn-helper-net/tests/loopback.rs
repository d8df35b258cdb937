//! Two helpers talking over real iroh endpoints on the loopback interface.

use bytes::Bytes;
use fastn_helper_core::{
    CONNECTION_LOST_REASON, Helper, HelperConfig, STREAM_RESET_REASON, StreamId, SubscriptionId,
    Upcall, UpcallReceiver,
};
use fastn_helper_net::{EndpointConfig, IrohTransport};
use std::time::Duration;

const PROTOCOL: &str = "/mina/97";

struct Node {
    transport: IrohTransport,
    helper: Helper,
    upcalls: UpcallReceiver,
}

impl Node {
    async fn new() -> Self {
        let mut config = EndpointConfig::new(iroh::SecretKey::from_bytes(&rand::random()));
        config.discovery = false;
        config.relay = false;
        let endpoint = fastn_helper_net::bind(config).await.unwrap();
        let transport = IrohTransport::new(endpoint);
        let (helper, upcalls) =
            Helper::new(std::sync::Arc::new(transport.clone()), HelperConfig::default());
        helper
            .add_stream_handler(PROTOCOL.to_string())
            .await
            .unwrap();
        Self {
            transport,
            helper,
            upcalls,
        }
    }

    fn loopback_addrs(&self) -> Vec<String> {
        self.transport
            .endpoint()
            .bound_sockets()
            .into_iter()
            .filter(|addr| addr.is_ipv4())
            .map(|addr| format!("127.0.0.1:{}", addr.port()))
            .collect()
    }

    async fn next(&mut self) -> Upcall {
        tokio::time::timeout(Duration::from_secs(20), self.upcalls.recv())
            .await
            .expect("timed out waiting for an upcall")
            .expect("upcall channel closed")
    }
}

impl Node {
    /// The next two upcalls, in the order the helper emitted them.
    async fn next_two(&mut self) -> Vec<Upcall> {
        vec![self.next().await, self.next().await]
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(upcall)) =
            tokio::time::timeout(Duration::from_millis(500), self.upcalls.recv()).await
        {
            panic!("unexpected upcall {upcall:?}");
        }
    }
}

async fn connected_pair() -> (Node, Node) {
    let mut alice = Node::new().await;
    let mut bob = Node::new().await;
    alice
        .helper
        .add_peer(bob.transport.peer_id(), bob.loopback_addrs())
        .await
        .unwrap();

    assert!(matches!(
        alice.next().await,
        Upcall::PeerConnected { peer, .. } if peer == bob.transport.peer_id()
    ));
    assert!(matches!(
        bob.next().await,
        Upcall::PeerConnected { peer, .. } if peer == alice.transport.peer_id()
    ));
    (alice, bob)
}

async fn open(alice: &mut Node, bob: &mut Node) -> (StreamId, StreamId) {
    let ours = alice
        .helper
        .open_stream(bob.transport.peer_id(), PROTOCOL.to_string())
        .await
        .unwrap();
    let theirs = match bob.next().await {
        Upcall::IncomingStream {
            stream_id,
            protocol,
            peer,
        } => {
            assert_eq!(protocol, PROTOCOL);
            assert_eq!(peer.peer, alice.transport.peer_id());
            stream_id
        }
        other => panic!("expected IncomingStream, got {other:?}"),
    };
    (ours, theirs)
}

#[tokio::test]
async fn test_stream_roundtrip_and_close() {
    let (mut alice, mut bob) = connected_pair().await;
    let (a, b) = open(&mut alice, &mut bob).await;

    alice
        .helper
        .send_stream(a, Bytes::from_static(b"somedata"))
        .await
        .unwrap();
    assert_eq!(
        bob.next().await,
        Upcall::StreamMessageReceived {
            stream_id: b,
            data: Bytes::from_static(b"somedata"),
        }
    );

    alice.helper.close_stream(a).await.unwrap();
    assert_eq!(alice.next().await, Upcall::StreamComplete { stream_id: a });
    assert_eq!(bob.next().await, Upcall::StreamComplete { stream_id: b });

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_reset_reaches_the_other_side() {
    let (mut alice, mut bob) = connected_pair().await;
    let (a, b) = open(&mut alice, &mut bob).await;

    alice.helper.reset_stream(a).await.unwrap();
    assert_eq!(
        alice.next().await,
        Upcall::StreamLost {
            stream_id: a,
            reason: STREAM_RESET_REASON.to_string(),
        }
    );
    assert_eq!(
        bob.next().await,
        Upcall::StreamLost {
            stream_id: b,
            reason: STREAM_RESET_REASON.to_string(),
        }
    );

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_unhandled_protocol_is_refused() {
    let (alice, bob) = connected_pair().await;
    let result = alice
        .helper
        .open_stream(bob.transport.peer_id(), "/nobody/1".to_string())
        .await;
    assert!(matches!(
        result,
        Err(fastn_helper_core::HelperError::StreamOpenFailed { .. })
    ));

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_gossip_is_delivered_to_subscribers() {
    let (mut alice, bob) = connected_pair().await;
    alice
        .helper
        .subscribe("test".to_string(), Some(SubscriptionId(123)))
        .await
        .unwrap();

    bob.helper
        .publish("test", Bytes::from_static(b"bla-bla"))
        .await
        .unwrap();
    assert_eq!(
        alice.next().await,
        Upcall::GossipReceived {
            subscription_id: SubscriptionId(123),
            sender: bob.transport.peer_id(),
            data: Bytes::from_static(b"bla-bla"),
        }
    );

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_loses_streams_with_one_reason() {
    let (mut alice, mut bob) = connected_pair().await;
    let (a, b) = open(&mut alice, &mut bob).await;
    let alice_id = alice.transport.peer_id();
    let bob_id = bob.transport.peer_id();

    bob.transport.shutdown().await;

    // the reader and the connection task race; both report the same loss
    let seen = alice.next_two().await;
    assert!(seen.contains(&Upcall::PeerDisconnected { peer: bob_id }));
    assert!(seen.contains(&Upcall::StreamLost {
        stream_id: a,
        reason: CONNECTION_LOST_REASON.to_string(),
    }));
    alice.assert_quiet().await;

    let seen = bob.next_two().await;
    assert!(seen.contains(&Upcall::PeerDisconnected { peer: alice_id }));
    assert!(seen.contains(&Upcall::StreamLost {
        stream_id: b,
        reason: CONNECTION_LOST_REASON.to_string(),
    }));
    bob.assert_quiet().await;

    alice.transport.shutdown().await;
}
