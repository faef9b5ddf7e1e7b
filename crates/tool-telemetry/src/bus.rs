use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;

type Callback = Arc<dyn Fn(u64) + Send + Sync>;

struct Registry {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(u64, Callback)>>,
}

/// Generation-counter invalidation signal.
///
/// Carries no event data: consumers that see the generation move re-derive
/// whatever they need from the store. Async waiters go through a `watch`
/// channel, so bursts coalesce and nothing is ever queued.
pub struct InvalidationBus {
    generation: AtomicU64,
    tx: watch::Sender<u64>,
    registry: Arc<Registry>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            generation: AtomicU64::new(0),
            tx,
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                callbacks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Bump the generation, wake watchers and run every subscribed callback.
    pub fn notify(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // send_replace never fails, even with no receivers alive
        self.tx.send_replace(generation);

        let callbacks: Vec<Callback> = self
            .registry
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(generation);
        }
        generation
    }

    /// Register a callback invoked with the new generation on every `notify`.
    ///
    /// Callbacks run inline on the notifying thread, which is the ingest path,
    /// and must not block. Slow consumers should await [`watch`](Self::watch)
    /// instead. The callback stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .callbacks
            .write()
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// A receiver whose value is the latest generation.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.callbacks.read().len()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered invalidation callback.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // removal happens in Drop
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.callbacks.write().retain(|(id, _)| *id != self.id);
        }
    }
}
