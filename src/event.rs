//! Per-mechanism event bus.
//!
//! Each `CircuitBreaker`, `RetryExecutor`, and `RateLimiter` owns one of
//! these. Subscribers register a handler that runs on the bus's own worker
//! task; delivery to a given subscriber is FIFO, but there is no ordering
//! guarantee between subscribers. Actually shipping an event somewhere
//! (a metrics sink, a log aggregator) is a collaborator's job — this bus
//! only does in-process fan-out.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Token returned by [`EventBus::subscribe`], used to cancel that one
/// subscription with [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Default capacity of the underlying broadcast channel. A slow subscriber
/// that falls behind by more than this many events skips ahead rather than
/// blocking emitters.
const DEFAULT_CAPACITY: usize = 256;

/// A fan-out channel of events of type `E`.
pub struct EventBus<E: Clone + Send + 'static> {
    sender: broadcast::Sender<E>,
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Creates a bus with the default backlog capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus whose broadcast backlog holds `capacity` events before
    /// the slowest subscriber starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Publishes an event to all current subscribers. A no-op if nobody is
    /// subscribed.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Registers `handler` to run, on its own task, for every event emitted
    /// from now on. Returns a token that can be passed to
    /// [`EventBus::unsubscribe`].
    pub fn subscribe<F>(&self, mut handler: F) -> SubscriptionId
    where
        F: FnMut(E) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.subscriptions.lock().insert(id, join);
        SubscriptionId(id)
    }

    /// Stops a single subscription. No-op if it was already cancelled.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(handle) = self.subscriptions.lock().remove(&id.0) {
            handle.abort();
        }
    }

    /// Stops all current subscribers without tearing down the bus itself —
    /// `emit` keeps working and new subscribers can still register.
    pub fn cancel_listeners(&self) {
        let mut subscriptions = self.subscriptions.lock();
        for (_, handle) in subscriptions.drain() {
            handle.abort();
        }
    }

    /// Number of currently registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Drop for EventBus<E> {
    fn drop(&mut self) {
        self.cancel_listeners();
    }
}
