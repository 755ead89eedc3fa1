//! Event System
//!
//! Provides a pub/sub event bus for inter-component communication.
//!
//! Subscribers are held in an immutable snapshot. Subscribing swaps in a new
//! snapshot; publishing clones the current one and delivers outside the lock,
//! so subscription changes never race with delivery.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::debug;

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription<E> {
    receiver: Receiver<E>,
}

impl<E> EventSubscription<E> {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<E, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Receive the next event, giving up after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<E, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<E, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every event that is already queued
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }

    /// Get an iterator over events
    pub fn iter(&self) -> impl Iterator<Item = E> + '_ {
        self.receiver.iter()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus<E> {
    subscribers: RwLock<Arc<Vec<Sender<E>>>>,
}

impl<E: Clone + Debug> EventBus<E> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription<E> {
        let (sender, receiver) = unbounded();
        let mut subscribers = self.subscribers.write();
        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push(sender);
        *subscribers = Arc::new(next);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: E) -> usize {
        let snapshot = Arc::clone(&self.subscribers.read());
        let mut delivered = 0;
        let mut closed = Vec::new();

        for sender in snapshot.iter() {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(sender.clone());
            }
        }

        debug!("Event {:?} delivered to {} subscribers", event, delivered);

        if !closed.is_empty() {
            self.remove_closed(&closed);
        }
        delivered
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn remove_closed(&self, closed: &[Sender<E>]) {
        let mut subscribers = self.subscribers.write();
        let live: Vec<Sender<E>> = subscribers
            .iter()
            .filter(|s| !closed.iter().any(|c| c.same_channel(s)))
            .cloned()
            .collect();
        *subscribers = Arc::new(live);
    }
}

impl<E: Clone + Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
