//! In-flight transfer tracking
//!
//! An [`Anchor`] records the ids of submitted transfers until their
//! completion handlers finish, so teardown can cancel them all and wait for
//! the set to drain.

use common::Transport;
use protocol::TransferId;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

pub struct Anchor {
    name: &'static str,
    ids: Mutex<HashSet<TransferId>>,
    emptied: Condvar,
}

impl Anchor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ids: Mutex::new(HashSet::new()),
            emptied: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<TransferId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a transfer; call before handing it to the transport
    pub fn add(&self, id: TransferId) {
        self.lock().insert(id);
    }

    /// Stop tracking a transfer, waking waiters when the set empties
    pub fn remove(&self, id: TransferId) -> bool {
        let mut ids = self.lock();
        let removed = ids.remove(&id);
        if ids.is_empty() {
            self.emptied.notify_all();
        }
        removed
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of tracked ids, oldest submission first
    pub fn ids(&self) -> Vec<TransferId> {
        let mut ids: Vec<TransferId> = self.lock().iter().copied().collect();
        ids.sort();
        ids
    }

    /// Ask the transport to cancel every tracked transfer
    ///
    /// The lock is not held across `cancel`, which may complete the transfer
    /// (and call [`Anchor::remove`]) on this thread.
    pub fn cancel_all(&self, transport: &dyn Transport) {
        for id in self.ids() {
            trace!("{}: cancelling transfer {:?}", self.name, id);
            transport.cancel(id);
        }
    }

    /// Block until no transfer is tracked or `timeout` elapses
    ///
    /// Returns true if the anchor drained.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        self.wait_empty_until(Instant::now() + timeout)
    }

    /// Block until no transfer is tracked or `deadline` passes
    pub fn wait_empty_until(&self, deadline: Instant) -> bool {
        let mut ids = self.lock();

        while !ids.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            ids = self
                .emptied
                .wait_timeout(ids, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Forget every tracked transfer, returning how many were dropped
    pub fn abandon(&self) -> usize {
        let mut ids = self.lock();
        let dropped = ids.len();
        ids.clear();
        self.emptied.notify_all();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_anchor_does_not_wait() {
        let anchor = Anchor::new("test");
        assert!(anchor.wait_empty(Duration::ZERO));
    }

    #[test]
    fn test_wait_times_out_with_tracked_transfer() {
        let anchor = Anchor::new("test");
        anchor.add(TransferId(1));

        let start = Instant::now();
        assert!(!anchor.wait_empty(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_passed_deadline_returns_at_once() {
        let anchor = Anchor::new("test");
        anchor.add(TransferId(1));

        let start = Instant::now();
        assert!(!anchor.wait_empty_until(start));
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_remove_from_other_thread_wakes_waiter() {
        let anchor = Arc::new(Anchor::new("test"));
        anchor.add(TransferId(1));
        anchor.add(TransferId(2));

        let remover = {
            let anchor = anchor.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                anchor.remove(TransferId(2));
                anchor.remove(TransferId(1));
            })
        };

        assert!(anchor.wait_empty(Duration::from_secs(5)));
        remover.join().unwrap();
    }

    #[test]
    fn test_ids_are_ordered_and_abandon_clears() {
        let anchor = Anchor::new("test");
        anchor.add(TransferId(7));
        anchor.add(TransferId(3));

        assert_eq!(anchor.ids(), vec![TransferId(3), TransferId(7)]);
        assert!(anchor.contains(TransferId(7)));
        assert_eq!(anchor.abandon(), 2);
        assert!(anchor.is_empty());
        assert!(!anchor.remove(TransferId(3)));
    }
}
