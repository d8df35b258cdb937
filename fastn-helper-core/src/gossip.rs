//! Gossip subscriptions.
//!
//! Several subscriptions may share a topic. The transport joins a topic when
//! its first subscription appears and leaves it when the last one goes, and
//! every message received on the topic is handed to each live subscription.

use crate::{
    HelperError, IdAllocator, PeerId, SubscriptionId, Transport, Upcall, UpcallSender,
};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where the transport stands for a topic. `Joining` and `Leaving` last
/// while a transport call is in flight; nobody holds the topic lock then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Membership {
    #[default]
    Left,
    Joining,
    Joined,
    Leaving,
}

#[derive(Debug, Default)]
struct TopicMembership {
    state: Membership,
    subscribers: BTreeSet<SubscriptionId>,
    /// Set once the slot is dropped from the table; holders must look again.
    removed: bool,
}

#[derive(Debug, Default)]
struct TopicSlot {
    membership: tokio::sync::Mutex<TopicMembership>,
    /// Fired whenever a join or leave finishes.
    settled: tokio::sync::Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicCall {
    Join,
    Leave,
}

pub struct SubscriptionTable {
    ids: IdAllocator,
    subscriptions: scc::HashMap<SubscriptionId, String>,
    topics: scc::HashMap<String, Arc<TopicSlot>>,
    transport: Arc<dyn Transport>,
    upcalls: UpcallSender,
}

impl SubscriptionTable {
    pub fn new(transport: Arc<dyn Transport>, upcalls: UpcallSender) -> Self {
        Self {
            ids: IdAllocator::new(),
            subscriptions: scc::HashMap::new(),
            topics: scc::HashMap::new(),
            transport,
            upcalls,
        }
    }

    async fn topic(&self, topic: &str) -> Arc<TopicSlot> {
        self.topics
            .entry_async(topic.to_string())
            .await
            .or_insert_with(Default::default)
            .get()
            .clone()
    }

    /// Drops an idle slot. Caller holds its lock.
    async fn forget(&self, topic: &str, slot: &Arc<TopicSlot>, membership: &mut TopicMembership) {
        membership.removed = true;
        self.topics
            .remove_if_async(topic, |current| Arc::ptr_eq(current, slot))
            .await;
        tracing::debug!(%topic, "topic dropped");
    }

    /// Claims `requested`, or the next free allocated id.
    async fn claim(
        &self,
        topic: &str,
        requested: Option<SubscriptionId>,
    ) -> Result<SubscriptionId, HelperError> {
        if let Some(id) = requested {
            return match self.subscriptions.insert_async(id, topic.to_string()).await {
                Ok(()) => Ok(id),
                Err(_) => Err(HelperError::SubscriptionExists(id)),
            };
        }

        loop {
            // skips ids the host picked itself
            let id = SubscriptionId(self.ids.next());
            if self
                .subscriptions
                .insert_async(id, topic.to_string())
                .await
                .is_ok()
            {
                return Ok(id);
            }
        }
    }

    /// Subscribes to `topic`, joining it first if nobody follows it yet.
    ///
    /// A subscription made while the topic is being left counts at once; the
    /// leave is followed by a rejoin.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(
        &self,
        topic: String,
        requested: Option<SubscriptionId>,
    ) -> Result<SubscriptionId, HelperError> {
        let id = self.claim(&topic, requested).await?;

        loop {
            let slot = self.topic(&topic).await;
            let settled = slot.settled.notified();
            {
                let mut membership = slot.membership.lock().await;
                if membership.removed {
                    continue;
                }
                match membership.state {
                    Membership::Joined | Membership::Leaving => {
                        membership.subscribers.insert(id);
                        return Ok(id);
                    }
                    Membership::Left => membership.state = Membership::Joining,
                    Membership::Joining => {
                        drop(membership);
                        settled.await;
                        continue;
                    }
                }
            }

            let joined = self.transport.join_topic(&topic).await;

            let mut membership = slot.membership.lock().await;
            slot.settled.notify_waiters();
            return match joined {
                Ok(()) => {
                    tracing::debug!(%topic, "joined topic");
                    membership.state = Membership::Joined;
                    membership.subscribers.insert(id);
                    Ok(id)
                }
                Err(e) => {
                    tracing::warn!(%topic, "join failed: {e}");
                    membership.state = Membership::Left;
                    self.subscriptions.remove_async(&id).await;
                    if membership.subscribers.is_empty() {
                        self.forget(&topic, &slot, &mut membership).await;
                    }
                    Err(e.into())
                }
            };
        }
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), HelperError> {
        let (_, topic) = self
            .subscriptions
            .remove_async(&id)
            .await
            .ok_or(HelperError::UnknownSubscription(id))?;

        let Some(slot) = self.topics.read_async(&topic, |_, slot| slot.clone()).await else {
            return Ok(());
        };
        {
            let mut membership = slot.membership.lock().await;
            membership.subscribers.remove(&id);
            if !membership.subscribers.is_empty() {
                return Ok(());
            }
            match membership.state {
                Membership::Joined => membership.state = Membership::Leaving,
                Membership::Left => {
                    self.forget(&topic, &slot, &mut membership).await;
                    return Ok(());
                }
                // whoever is talking to the transport sees the empty set
                Membership::Joining | Membership::Leaving => return Ok(()),
            }
        }

        self.settle(&topic, &slot, TopicCall::Leave).await;
        Ok(())
    }

    /// Runs `call`, then keeps joining or leaving until the transport
    /// matches whether the topic still has subscribers.
    async fn settle(&self, topic: &str, slot: &Arc<TopicSlot>, mut call: TopicCall) {
        loop {
            let result = match call {
                TopicCall::Join => self.transport.join_topic(topic).await,
                TopicCall::Leave => self.transport.leave_topic(topic).await,
            };

            let mut membership = slot.membership.lock().await;
            let joined = match (call, result) {
                (TopicCall::Leave, Ok(())) => {
                    tracing::debug!(%topic, "left topic");
                    false
                }
                (TopicCall::Leave, Err(e)) => {
                    tracing::warn!(%topic, "leave failed: {e}");
                    false
                }
                (TopicCall::Join, Ok(())) => {
                    tracing::debug!(%topic, "rejoined topic");
                    true
                }
                (TopicCall::Join, Err(e)) => {
                    // the next subscribe tries to join again
                    tracing::warn!(
                        %topic,
                        waiting = membership.subscribers.len(),
                        "rejoin failed: {e}"
                    );
                    membership.state = Membership::Left;
                    if membership.subscribers.is_empty() {
                        self.forget(topic, slot, &mut membership).await;
                    }
                    slot.settled.notify_waiters();
                    return;
                }
            };

            let wanted = !membership.subscribers.is_empty();
            if joined == wanted {
                if joined {
                    membership.state = Membership::Joined;
                } else {
                    membership.state = Membership::Left;
                    self.forget(topic, slot, &mut membership).await;
                }
                slot.settled.notify_waiters();
                return;
            }

            if wanted {
                membership.state = Membership::Joining;
                call = TopicCall::Join;
            } else {
                membership.state = Membership::Leaving;
                call = TopicCall::Leave;
            }
        }
    }

    /// Sends to the topic. We never receive our own messages back.
    pub async fn publish(&self, topic: &str, data: Bytes) -> Result<(), HelperError> {
        tracing::trace!(%topic, len = data.len(), "publishing");
        self.transport.publish(topic, data).await?;
        Ok(())
    }

    pub(crate) async fn on_gossip_received(&self, topic: &str, sender: PeerId, data: Bytes) {
        let Some(slot) = self.topics.read_async(topic, |_, slot| slot.clone()).await else {
            tracing::debug!(%topic, %sender, "gossip for a topic nobody follows");
            return;
        };

        let membership = slot.membership.lock().await;
        for subscription_id in membership.subscribers.iter().copied() {
            self.upcalls
                .emit(Upcall::GossipReceived {
                    subscription_id,
                    sender,
                    data: data.clone(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, StubTransport, peer};

    fn table() -> (Arc<StubTransport>, Arc<SubscriptionTable>, crate::UpcallReceiver) {
        let transport = Arc::new(StubTransport::default());
        let (tx, rx) = crate::channel(16);
        (
            transport.clone(),
            Arc::new(SubscriptionTable::new(transport, tx)),
            rx,
        )
    }

    fn joins(transport: &StubTransport) -> usize {
        transport
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Join(_)))
            .count()
    }

    #[tokio::test]
    async fn test_joins_once_per_topic() {
        let (transport, table, _rx) = table();
        let a = table.subscribe("test".into(), None).await.unwrap();
        let b = table.subscribe("test".into(), None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.calls(), vec![Call::Join("test".into())]);
    }

    #[tokio::test]
    async fn test_host_chosen_id() {
        let (_transport, table, _rx) = table();
        let id = table
            .subscribe("test".into(), Some(SubscriptionId(1)))
            .await
            .unwrap();
        assert_eq!(id, SubscriptionId(1));

        assert!(matches!(
            table.subscribe("other".into(), Some(SubscriptionId(1))).await,
            Err(HelperError::SubscriptionExists(SubscriptionId(1)))
        ));

        // allocation steps over the taken id
        let next = table.subscribe("test".into(), None).await.unwrap();
        assert_eq!(next, SubscriptionId(2));
    }

    #[tokio::test]
    async fn test_failed_join_releases_the_id() {
        let (transport, table, _rx) = table();
        transport.fail_joins();
        assert!(
            table
                .subscribe("test".into(), Some(SubscriptionId(123)))
                .await
                .is_err()
        );
        assert!(!table.subscriptions.contains_async(&SubscriptionId(123)).await);
        assert!(table.topics.is_empty());
    }

    #[tokio::test]
    async fn test_fans_out_per_subscription() {
        let (_transport, table, mut rx) = table();
        let a = table.subscribe("test".into(), None).await.unwrap();
        let b = table.subscribe("test".into(), None).await.unwrap();
        table.subscribe("other".into(), None).await.unwrap();

        table
            .on_gossip_received("test", peer(3), Bytes::from_static(b"bla-bla"))
            .await;

        for id in [a, b] {
            assert_eq!(
                rx.try_recv(),
                Some(Upcall::GossipReceived {
                    subscription_id: id,
                    sender: peer(3),
                    data: Bytes::from_static(b"bla-bla"),
                })
            );
        }
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_leaves_after_last_unsubscribe() {
        let (transport, table, mut rx) = table();
        let a = table.subscribe("test".into(), None).await.unwrap();
        let b = table.subscribe("test".into(), None).await.unwrap();

        table.unsubscribe(a).await.unwrap();
        assert!(!transport.calls().contains(&Call::Leave("test".into())));
        table.unsubscribe(b).await.unwrap();
        assert!(transport.calls().contains(&Call::Leave("test".into())));
        assert!(table.topics.is_empty());

        assert!(matches!(
            table.unsubscribe(b).await,
            Err(HelperError::UnknownSubscription(_))
        ));

        table
            .on_gossip_received("test", peer(3), Bytes::from_static(b"late"))
            .await;
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topics_do_not_pile_up() {
        let (_transport, table, _rx) = table();
        for n in 0..50 {
            let id = table.subscribe(format!("topic-{n}"), None).await.unwrap();
            table.unsubscribe(id).await.unwrap();
        }
        assert!(table.topics.is_empty());
        assert!(table.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_pending_leave_does_not_block_the_topic() {
        let (transport, table, mut rx) = table();
        let first = table.subscribe("u".into(), None).await.unwrap();
        let gate = transport.hold_leaves();

        let leaving = tokio::spawn({
            let table = table.clone();
            async move { table.unsubscribe(first).await }
        });
        transport.called(&Call::Leave("u".into())).await;

        // the leave is still with the transport
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            table.subscribe("u".into(), None),
        )
        .await
        .expect("subscribe waited for the leave")
        .unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            table.on_gossip_received("u", peer(3), Bytes::from_static(b"hi")),
        )
        .await
        .expect("delivery waited for the leave");
        assert_eq!(
            rx.try_recv(),
            Some(Upcall::GossipReceived {
                subscription_id: second,
                sender: peer(3),
                data: Bytes::from_static(b"hi"),
            })
        );

        gate.notify_one();
        leaving.await.unwrap().unwrap();

        // the leave is followed by a rejoin for the new subscriber
        assert_eq!(
            transport.calls(),
            vec![
                Call::Join("u".into()),
                Call::Leave("u".into()),
                Call::Join("u".into()),
            ]
        );
        let slot = table.topics.read_async("u", |_, slot| slot.clone()).await.unwrap();
        assert_eq!(slot.membership.lock().await.state, Membership::Joined);

        // a later subscriber needs no further join
        table.subscribe("u".into(), None).await.unwrap();
        assert_eq!(joins(&transport), 2);
    }

    #[tokio::test]
    async fn test_publish_is_forwarded() {
        let (transport, table, mut rx) = table();
        table.subscribe("test".into(), None).await.unwrap();
        table
            .publish("test", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(
            transport
                .calls()
                .contains(&Call::Publish("test".into(), Bytes::from_static(b"hi")))
        );
        assert!(rx.try_recv().is_none());
    }
}
