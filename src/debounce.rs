//! Trailing-edge debounce keyed by arbitrary key.
//!
//! Three places need the same shape: document saves (keyed by document id),
//! sync-state saves (keyed by storage id), and outbound sync messages (keyed
//! by document + peer). `KeyedDebouncer` owns one timer per key; scheduling a
//! key restarts its timer, and when a timer runs out the key is delivered on
//! the paired channel for the consumer to act on.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A trailing-edge debouncer delivering fired keys over a channel.
pub struct KeyedDebouncer<K> {
    delay: Duration,
    fire_tx: mpsc::UnboundedSender<K>,
    pending: Arc<Mutex<HashMap<K, JoinHandle<()>>>>,
}

impl<K> KeyedDebouncer<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a debouncer and the channel its fired keys arrive on.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<K>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                fire_tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            fire_rx,
        )
    }

    /// Schedule (or reschedule) a key. The key fires `delay` after the most
    /// recent call that named it.
    pub fn schedule(&self, key: K) {
        let delay = self.delay;
        let fire_tx = self.fire_tx.clone();
        let pending = self.pending.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().unwrap().remove(&task_key);
            let _ = fire_tx.send(task_key);
        });

        if let Some(previous) = self.pending.lock().unwrap().insert(key, handle) {
            previous.abort();
        }
    }

    /// Drop a pending key without firing it.
    pub fn cancel(&self, key: &K) {
        if let Some(handle) = self.pending.lock().unwrap().remove(key) {
            handle.abort();
        }
    }

    /// Abort every pending timer. Used on shutdown.
    pub fn cancel_all(&self) {
        for (_, handle) in self.pending.lock().unwrap().drain() {
            handle.abort();
        }
    }

    /// Number of keys currently waiting to fire.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}
