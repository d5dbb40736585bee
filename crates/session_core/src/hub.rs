//! Per-phone fan-out of inbound messages to live-update subscribers.
//!
//! Each subscriber owns a bounded queue. Delivery uses `try_send`, so a slow
//! consumer loses events (logged) instead of stalling the publisher, and a
//! consumer that went away is pruned on the next publish or when its
//! [`Subscriber`] is dropped.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard, Weak},
    task::{Context, Poll},
};

use futures::Stream;
use link_guard::LinkDangerDetector;
use shared::{
    domain::{Phone, SubscriberId},
    protocol::LiveUpdate,
};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, mpsc::error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::remote::{RemoteClient, RemoteMessage};

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

struct SubscriberSlot {
    id: SubscriberId,
    tx: mpsc::Sender<LiveUpdate>,
}

struct Forwarder {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct EventHub {
    detector: Arc<LinkDangerDetector>,
    queue_capacity: usize,
    subscribers: RwLock<HashMap<Phone, Vec<SubscriberSlot>>>,
    forwarders: Mutex<HashMap<Phone, Forwarder>>,
}

impl EventHub {
    pub fn new(detector: Arc<LinkDangerDetector>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            detector,
            queue_capacity: queue_capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
            forwarders: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(self: &Arc<Self>, phone: &Phone) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = SubscriberId::new();
        self.subscribers_mut()
            .entry(phone.clone())
            .or_default()
            .push(SubscriberSlot { id, tx });
        debug!(%phone, subscriber = %id.0, "live subscriber attached");

        Subscriber {
            id,
            phone: phone.clone(),
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Detaches `subscriber` and releases its queue.
    pub fn unsubscribe(&self, subscriber: Subscriber) {
        drop(subscriber);
    }

    pub fn subscriber_count(&self, phone: &Phone) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(phone)
            .map_or(0, Vec::len)
    }

    /// Annotates `message` with link dangers and pushes it to every current
    /// subscriber of `phone`. Returns how many subscribers accepted it.
    pub async fn publish(&self, phone: &Phone, message: RemoteMessage) -> usize {
        if self.subscriber_count(phone) == 0 {
            return 0;
        }

        let dangers = self.detector.detect(message.text.as_deref()).await;
        if !dangers.is_empty() {
            warn!(
                %phone,
                peer_id = message.peer_id.0,
                message_id = message.message_id.0,
                flagged = dangers.len(),
                "inbound message contains dangerous links"
            );
        }

        self.deliver(
            phone,
            LiveUpdate {
                peer_id: message.peer_id,
                message_id: message.message_id,
                text: message.text.unwrap_or_default(),
                timestamp: message.timestamp,
                outbound: message.outbound,
                dangers,
            },
        )
    }

    fn deliver(&self, phone: &Phone, update: LiveUpdate) -> usize {
        let mut subscribers = self.subscribers_mut();
        let Some(slots) = subscribers.get_mut(phone) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send(update.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    %phone,
                    subscriber = %slot.id.0,
                    message_id = update.message_id.0,
                    "subscriber queue full; dropping live update"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%phone, subscriber = %slot.id.0, "pruning closed subscriber");
                false
            }
        });
        if slots.is_empty() {
            subscribers.remove(phone);
        }
        delivered
    }

    /// Starts forwarding `client`'s inbound messages for `phone`. A repeat
    /// call for the same connection generation is a no-op; a newer
    /// generation replaces the previous forwarder.
    pub fn attach(
        self: &Arc<Self>,
        phone: &Phone,
        generation: u64,
        client: &Arc<dyn RemoteClient>,
    ) -> bool {
        let mut forwarders = self.forwarders_mut();
        if let Some(existing) = forwarders.get(phone) {
            if existing.generation == generation && !existing.task.is_finished() {
                return false;
            }
            existing.task.abort();
        }

        let mut inbound = client.subscribe_new_messages();
        let hub = Arc::downgrade(self);
        let task_phone = phone.clone();
        let task = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => {
                        let Some(hub) = hub.upgrade() else {
                            break;
                        };
                        hub.publish(&task_phone, message).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(phone = %task_phone, skipped, "inbound message stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!(phone = %task_phone, "inbound message stream closed");
                        break;
                    }
                }
            }
        });

        forwarders.insert(phone.clone(), Forwarder { generation, task });
        info!(%phone, generation, "inbound messages attached to live hub");
        true
    }

    /// Stops the forwarder for `phone` if it still belongs to `generation`.
    pub fn detach(&self, phone: &Phone, generation: u64) {
        let mut forwarders = self.forwarders_mut();
        if forwarders
            .get(phone)
            .is_some_and(|f| f.generation == generation)
        {
            if let Some(forwarder) = forwarders.remove(phone) {
                forwarder.task.abort();
            }
        }
    }

    pub fn is_attached(&self, phone: &Phone) -> bool {
        self.forwarders_mut()
            .get(phone)
            .is_some_and(|f| !f.task.is_finished())
    }

    /// Ends every live stream and stops all forwarders.
    pub fn close_all(&self) {
        for (_, forwarder) in self.forwarders_mut().drain() {
            forwarder.task.abort();
        }
        let dropped: usize = self.subscribers_mut().drain().map(|(_, s)| s.len()).sum();
        info!(subscribers = dropped, "live hub closed");
    }

    fn remove_subscriber(&self, phone: &Phone, id: SubscriberId) {
        let mut subscribers = self.subscribers_mut();
        if let Some(slots) = subscribers.get_mut(phone) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                subscribers.remove(phone);
            }
        }
    }

    fn subscribers_mut(&self) -> RwLockWriteGuard<'_, HashMap<Phone, Vec<SubscriberSlot>>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn forwarders_mut(&self) -> MutexGuard<'_, HashMap<Phone, Forwarder>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live-update listener for one phone. Dropping it unsubscribes.
pub struct Subscriber {
    id: SubscriberId,
    phone: Phone,
    rx: mpsc::Receiver<LiveUpdate>,
    hub: Weak<EventHub>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn phone(&self) -> &Phone {
        &self.phone
    }

    /// Waits for the next update; `None` once the hub has shut down.
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        self.rx.recv().await
    }
}

impl Stream for Subscriber {
    type Item = LiveUpdate;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscriber(&self.phone, self.id);
            debug!(phone = %self.phone, subscriber = %self.id.0, "live subscriber detached");
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
