//! Fan-out of typed events to weakly held observers.
//!
//! The registry never owns an observer: dropping the last `Arc` of an
//! observer unsubscribes it implicitly. Publishing takes a snapshot of the
//! live observers and releases the registry lock before delivery, so an
//! observer may subscribe or unsubscribe from inside
//! [`Observer::notify`] without deadlocking or disturbing the current round.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tracing::{trace, warn};

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatcher");

/// Receives events published on an [`EventDispatcher`].
pub trait Observer<E>: Send + Sync {
    /// Handles one event. Must not block indefinitely.
    ///
    /// # Errors
    ///
    /// A failure is logged by the dispatcher; delivery to the remaining
    /// observers continues.
    fn notify(&self, event: &E) -> Result<(), ObserverError>;
}

/// Failure reported by an observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ObserverError {
    message: String,
}

impl ObserverError {
    /// Builds an error from a description of the failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription-{}", self.0)
    }
}

struct Entry<E> {
    id: SubscriptionId,
    address: usize,
    observer: Weak<dyn Observer<E>>,
}

/// Ordered registry of observers for events of type `E`.
pub struct EventDispatcher<E> {
    entries: Mutex<Vec<Entry<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventDispatcher<E> {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry<E>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Subscribes `observer`, which is held weakly.
    ///
    /// Observers are compared by identity: subscribing the same allocation
    /// again returns its existing id and keeps its original position.
    pub fn subscribe<O>(&self, observer: &Arc<O>) -> SubscriptionId
    where
        O: Observer<E> + 'static,
    {
        let address = Arc::as_ptr(observer).cast::<()>().addr();
        let mut entries = self.entries();
        entries.retain(|entry| entry.observer.strong_count() > 0);
        if let Some(existing) = entries.iter().find(|entry| entry.address == address) {
            return existing.id;
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn Observer<E>> = Arc::downgrade(observer) as Weak<dyn Observer<E>>;
        entries.push(Entry {
            id,
            address,
            observer: weak,
        });
        trace!(target: DISPATCH_TARGET, subscription = %id, "observer subscribed");
        id
    }

    /// Removes a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if removed {
            trace!(target: DISPATCH_TARGET, subscription = %id, "observer unsubscribed");
        }
        removed
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.observer.strong_count() > 0)
            .count()
    }

    /// True when no live observer is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every live observer in subscription order.
    ///
    /// Returns the number of observers that handled the event successfully.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<dyn Observer<E>>)> = {
            let mut entries = self.entries();
            entries.retain(|entry| entry.observer.strong_count() > 0);
            entries
                .iter()
                .filter_map(|entry| entry.observer.upgrade().map(|observer| (entry.id, observer)))
                .collect()
        };
        let mut delivered = 0;
        for (id, observer) in snapshot {
            match observer.notify(event) {
                Ok(()) => delivered += 1,
                Err(error) => warn!(
                    target: DISPATCH_TARGET,
                    subscription = %id,
                    error = %error,
                    "observer failed to handle event"
                ),
            }
        }
        delivered
    }
}

impl<E> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.len())
            .finish()
    }
}
