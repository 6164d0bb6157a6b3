//! Per-namespace change notifications.
//!
//! Secondary readers must wait for a concurrent chunk-apply to finish
//! without polling the refresh marker. Each namespace gets a generation
//! counter in a `watch` channel; a [`NamespaceSubscription`] captures the
//! generation at creation time and resolves once it advances. Publishing is
//! cheap and does not require any subscriber to exist.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::metadata::Namespace;

/// Multi-consumer, per-key change bus.
pub struct NamespaceNotifications {
    channels: Mutex<HashMap<Namespace, watch::Sender<u64>>>,
}

impl NamespaceNotifications {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to changes of `nss`. The subscription only observes
    /// notifications published after this call.
    #[must_use]
    pub fn subscribe(&self, nss: &Namespace) -> NamespaceSubscription {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(nss.clone())
            .or_insert_with(|| watch::channel(0).0);
        let mut rx = sender.subscribe();
        let seen = *rx.borrow_and_update();
        NamespaceSubscription { rx, seen }
    }

    /// Wake every subscription for `nss`. Channels nobody listens to any
    /// more are dropped on the way.
    pub fn notify(&self, nss: &Namespace) {
        let mut channels = self.channels.lock();
        if let Some(sender) = channels.get(nss) {
            sender.send_modify(|generation| *generation += 1);
        }
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for NamespaceNotifications {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-namespace subscription. Reusable: each [`wait`](Self::wait)
/// returns once the generation has advanced past the last one seen.
pub struct NamespaceSubscription {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl NamespaceSubscription {
    /// Wait for the next notification.
    pub async fn wait(&mut self) {
        loop {
            let current = *self.rx.borrow_and_update();
            if current != self.seen {
                self.seen = current;
                return;
            }
            if self.rx.changed().await.is_err() {
                // Publisher side is gone; nothing further will arrive.
                return;
            }
        }
    }
}
