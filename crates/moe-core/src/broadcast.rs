//! Fan-out of snapshots to live subscribers.
//!
//! A subscriber first receives the current snapshot, then every snapshot
//! published after it subscribed, in order. Slow subscribers lose old
//! snapshots rather than slowing the engine down.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use crate::snapshot::MoeSnapshot;

const CHANNEL_CAPACITY: usize = 64;

/// Clone-able via internal Arc.
#[derive(Clone)]
pub struct StateBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<MoeSnapshot>,
    current: RwLock<MoeSnapshot>,
}

impl StateBroadcaster {
    pub fn new(initial: MoeSnapshot) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tx,
                current: RwLock::new(initial),
            }),
        }
    }

    /// Publish a snapshot and return the receiver count.
    /// Returns 0 when nobody is subscribed.
    pub fn publish(&self, snapshot: MoeSnapshot) -> usize {
        // Holding the write lock while sending keeps subscribe() from seeing
        // the new snapshot as `initial` and then again on the channel.
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = snapshot.clone();
        self.inner.tx.send(snapshot).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        let current = self
            .inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Subscription {
            initial: Some(current.clone()),
            rx: self.inner.tx.subscribe(),
        }
    }

    pub fn current(&self) -> MoeSnapshot {
        self.inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

/// One subscriber's view of the snapshot stream.
pub struct Subscription {
    initial: Option<MoeSnapshot>,
    rx: broadcast::Receiver<MoeSnapshot>,
}

impl Subscription {
    /// Next snapshot; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<MoeSnapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
