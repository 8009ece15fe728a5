//! Single-flight registry: at most one in-flight computation per key.
//!
//! The first caller for a key becomes the leader and receives a
//! [`FlightGuard`]; later callers get a receiver that resolves with the
//! leader's outcome. The registry map is only locked (per shard) while a
//! flight is joined or removed, never while the computation runs.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::error::ComputeError;
use super::keys::CacheKey;

pub(crate) type Outcome<T> = Result<T, ComputeError>;

type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

pub(crate) struct InFlight<T> {
    calls: Arc<DashMap<CacheKey, Slot<T>>>,
}

pub(crate) enum Role<T> {
    Leader(FlightGuard<T>),
    Follower(Slot<T>),
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Join the flight for `key`, becoming its leader if none is running.
    pub fn join(&self, key: &CacheKey) -> Role<T> {
        match self.calls.entry(key.clone()) {
            Entry::Occupied(occupied) => Role::Follower(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(receiver);
                Role::Leader(FlightGuard {
                    key: key.clone(),
                    sender,
                    calls: Arc::clone(&self.calls),
                })
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Wait for the leader's outcome.
///
/// Returns `None` when the leader was dropped before finishing (for example
/// its task was cancelled); the caller should join again.
pub(crate) async fn wait<T: Clone>(mut slot: Slot<T>) -> Option<Outcome<T>> {
    loop {
        if let Some(outcome) = slot.borrow_and_update().as_ref() {
            return Some(outcome.clone());
        }
        if slot.changed().await.is_err() {
            return slot.borrow().clone();
        }
    }
}

/// Held by the leader of a flight. Dropping it closes the flight.
pub(crate) struct FlightGuard<T> {
    key: CacheKey,
    sender: watch::Sender<Option<Outcome<T>>>,
    calls: Arc<DashMap<CacheKey, Slot<T>>>,
}

impl<T> FlightGuard<T> {
    /// Publish the outcome to every follower and close the flight.
    pub fn complete(self, outcome: Outcome<T>) {
        self.sender.send_replace(Some(outcome));
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.calls.remove(&self.key);
    }
}
