//! In-process change bus
//!
//! One ordered broadcast queue per account, so intra-account ordering is
//! preserved while accounts never wait on each other. Subscribers get
//! at-least-once delivery over a bounded queue; a subscriber that falls
//! behind loses the oldest events and receives a single `Gap` marker
//! telling it to do a full refresh. A slow subscriber never blocks a
//! producer.
//!
//! The bus also feeds a bounded tap channel consumed by the
//! classification pipeline, keeping the sync scheduler and the pipeline
//! decoupled. A full tap sheds events; the pipeline recovers shed
//! messages by sweeping the store for unclassified rows.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::ChangeEvent;

/// Default per-subscriber queue capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// Pipeline tap capacity. Events beyond it are dropped rather than
/// blocking a producer; the pipeline's store sweep picks up anything
/// still unclassified.
pub const TAP_CAPACITY: usize = 1024;

/// Multi-subscriber event stream, one logical queue per account
pub struct ChangeBus {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    tap_tx: flume::Sender<ChangeEvent>,
}

impl ChangeBus {
    /// Create a bus and the pipeline tap receiving every published event
    pub fn new(capacity: usize) -> (Self, flume::Receiver<ChangeEvent>) {
        let (tap_tx, tap_rx) = flume::bounded(TAP_CAPACITY);
        let bus = Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
            tap_tx,
        };
        (bus, tap_rx)
    }

    /// Publish an event to the account's queue. Never blocks; subscribers
    /// that cannot keep up lag and later observe a gap.
    pub fn publish(&self, event: ChangeEvent) {
        // Feed the pipeline tap first. A closed tap means the pipeline
        // has shut down; a full one sheds the event, which the
        // pipeline's unclassified sweep later recovers.
        if let Err(flume::TrySendError::Full(_)) = self.tap_tx.try_send(event.clone()) {
            debug!("Pipeline tap full, event shed");
        }

        let account_id = event.account_id().to_string();
        let sender = {
            let channels = self.channels.read().expect("bus lock poisoned");
            channels.get(&account_id).cloned()
        };
        let sender = match sender {
            Some(s) => s,
            None => self.channel_for(&account_id),
        };
        // Err means no live subscribers, which is fine
        if sender.send(event).is_err() {
            debug!("No subscribers for account {}", account_id);
        }
    }

    /// Subscribe to one account's event stream
    pub fn subscribe(&self, account_id: &str) -> Subscription {
        let sender = self.channel_for(account_id);
        Subscription {
            account_id: account_id.to_string(),
            rx: sender.subscribe(),
        }
    }

    fn channel_for(&self, account_id: &str) -> broadcast::Sender<ChangeEvent> {
        let mut channels = self.channels.write().expect("bus lock poisoned");
        channels
            .entry(account_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Drop the queue of a removed account; existing subscriptions see
    /// end-of-stream once drained.
    pub fn remove_account(&self, account_id: &str) {
        let mut channels = self.channels.write().expect("bus lock poisoned");
        channels.remove(account_id);
    }
}

/// A subscriber's view of one account's event stream
pub struct Subscription {
    account_id: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Next event, in emission order. Returns `None` once the account's
    /// queue is gone and drained. Overflow surfaces as one
    /// [`ChangeEvent::Gap`] in place of the discarded events.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(
                    "Subscriber for {} lagged, {} events dropped",
                    self.account_id, skipped
                );
                Some(ChangeEvent::Gap {
                    account_id: self.account_id.clone(),
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant used by pull-style consumers
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => Some(ChangeEvent::Gap {
                account_id: self.account_id.clone(),
            }),
            Err(_) => None,
        }
    }
}
