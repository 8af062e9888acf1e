//! Typed publish/subscribe channel
//!
//! Every component owns one bus carrying a closed enum of notifications.
//! Subscribers receive every event published after they subscribed;
//! dropping the receiver unsubscribes.

use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber before it starts lagging
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus for a single event type
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers
    ///
    /// Publishing with no subscribers is not an error; the event is dropped.
    pub fn publish(&self, event: E) {
        if self.tx.send(event).is_err() {
            trace!("event published with no subscribers");
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
