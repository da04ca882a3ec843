use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

/// Subscription-control messages consumed by the manager's control loop.
pub enum SubscriberEvent {
    Subscribe {
        id: u64,
        channel: mpsc::Sender<Bytes>,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Fans replicated command bytes out to every subscribed replica writer.
///
/// Two loops back the manager: one drains subscribe/unsubscribe messages and
/// mutates the subscriber map, the other drains published events and copies
/// each one to every subscriber channel under the read lock. Subscriber
/// channels hold a single event, so a stalled replica stalls the fan-out;
/// socket writes stay in each replica's own forwarding loop.
#[derive(Clone)]
pub struct PubSubManager {
    subscriptions_tx: mpsc::Sender<SubscriberEvent>,
    events_tx: mpsc::Sender<Bytes>,
}

impl PubSubManager {
    pub fn start() -> Self {
        let (subscriptions_tx, mut subscriptions_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel::<Bytes>(16);

        let subscribers: Arc<RwLock<HashMap<u64, mpsc::Sender<Bytes>>>> = Arc::default();

        let subs = subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = subscriptions_rx.recv().await {
                match event {
                    SubscriberEvent::Subscribe { id, channel } => {
                        log::info!("subscribing replica {id}");
                        subs.write().await.insert(id, channel);
                    }
                    SubscriberEvent::Unsubscribe { id } => {
                        log::info!("unsubscribing replica {id}");
                        subs.write().await.remove(&id);
                    }
                }
            }
        });

        let subs = subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let subs = subs.read().await;
                for (id, channel) in subs.iter() {
                    if channel.send(event.clone()).await.is_err() {
                        log::warn!("replica {id} dropped its channel");
                    }
                }
            }
        });

        log::info!("pubsub manager started");
        Self {
            subscriptions_tx,
            events_tx,
        }
    }

    /// Registers a subscriber and hands back the receiving end of its
    /// event channel.
    pub async fn subscribe(&self, id: u64) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(1);
        let _ = self
            .subscriptions_tx
            .send(SubscriberEvent::Subscribe { id, channel: tx })
            .await;
        rx
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self
            .subscriptions_tx
            .send(SubscriberEvent::Unsubscribe { id })
            .await;
    }

    /// Enqueues one event for every current subscriber, in publish order.
    pub async fn publish(&self, event: Bytes) {
        let _ = self.events_tx.send(event).await;
    }
}
