//! Concurrent map from chunk index to a shared in-flight fetch, keyed so
//! that overlapping `paint` calls join a single fetch rather than re-issuing
//! it (`spec.md` §4.5 step 5, §9 "futures keyed by chunk index").

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::Error;

/// Terminal state of a fetch unit, cheap to clone so every subscriber can
/// hold its own copy after the owning task removes the slot.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The chunk was fetched, verified, and durably written.
    Done,
    /// The fetch or verification failed; carries a renderable message since
    /// the underlying [`Error`] is not `Clone`.
    Failed(String),
}

impl Outcome {
    /// Convert to a `Result`, mapping a failure to [`Error::Transport`].
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Self::Done => Ok(()),
            Self::Failed(msg) => Err(Error::Transport(msg)),
        }
    }
}

pub(crate) struct Slot {
    notify: Notify,
    outcome: parking_lot::Mutex<Option<Outcome>>,
}

/// Per-channel table of in-flight chunk fetches.
#[derive(Default)]
pub struct InFlight {
    slots: DashMap<u64, Arc<Slot>>,
}

impl InFlight {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ownership of `chunk_index`'s fetch if none is in flight,
    /// otherwise return a waiter for the existing one.
    pub fn acquire_or_wait(&self, chunk_index: u64) -> AcquireResult {
        match self.slots.entry(chunk_index) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let slot = Arc::new(Slot {
                    notify: Notify::new(),
                    outcome: parking_lot::Mutex::new(None),
                });
                v.insert(slot);
                AcquireResult::Owner
            }
            dashmap::mapref::entry::Entry::Occupied(o) => AcquireResult::Waiter(o.get().clone()),
        }
    }

    /// Whether no fetch is currently in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }

    /// Called by the owner once the fetch reaches a terminal state: records
    /// the outcome, wakes every waiter, and removes the slot.
    pub fn complete(&self, chunk_index: u64, outcome: Outcome) {
        if let Some((_, slot)) = self.slots.remove(&chunk_index) {
            *slot.outcome.lock() = Some(outcome);
            slot.notify.notify_waiters();
        }
    }
}

/// Result of [`InFlight::acquire_or_wait`].
pub enum AcquireResult {
    /// The caller must perform the fetch and call [`InFlight::complete`].
    Owner,
    /// Another caller owns the fetch; await its notification.
    Waiter(Arc<Slot>),
}

impl AcquireResult {
    /// If this is a [`Self::Waiter`], block until the owner completes and
    /// return its outcome.
    pub async fn wait(self) -> Option<Outcome> {
        match self {
            Self::Owner => None,
            Self::Waiter(slot) => {
                loop {
                    if let Some(outcome) = slot.outcome.lock().clone() {
                        return Some(outcome);
                    }
                    slot.notify.notified().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_for_first() {
        let table = InFlight::new();
        assert!(matches!(table.acquire_or_wait(0), AcquireResult::Owner));
        let waiter = table.acquire_or_wait(0);
        assert!(matches!(waiter, AcquireResult::Waiter(_)));

        table.complete(0, Outcome::Done);
        let outcome = waiter.wait().await.unwrap();
        assert!(matches!(outcome, Outcome::Done));
    }

    #[tokio::test]
    async fn slot_removed_after_completion() {
        let table = InFlight::new();
        let _ = table.acquire_or_wait(5);
        table.complete(5, Outcome::Done);
        assert!(matches!(table.acquire_or_wait(5), AcquireResult::Owner));
    }
}
