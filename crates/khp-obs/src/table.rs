//! Correlation table: request id → pending slot.
//!
//! One mutex and one condition variable shared by every waiter. A slot is
//! inserted before its request is transmitted, resolved at most once by the
//! receive side, and removed by the caller that owns it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ObsError, Result};
use crate::protocol::RequestResponse;

/// What a resolved request carries.
#[derive(Debug)]
pub(crate) enum Reply {
    Single(RequestResponse),
    Batch(Vec<RequestResponse>),
}

#[derive(Debug)]
enum Slot {
    Pending,
    Fulfilled(Reply),
    Failed(ObsError),
}

#[derive(Debug)]
struct Entry {
    link: u64,
    slot: Slot,
}

#[derive(Debug, Default)]
pub(crate) struct CorrelationTable {
    entries: Mutex<HashMap<u64, Entry>>,
    resolved: Condvar,
}

impl CorrelationTable {
    /// Insert a pending slot for `id`, issued on `link`.
    pub(crate) fn register(&self, id: u64, link: u64) {
        let _ = self.entries.lock().insert(
            id,
            Entry {
                link,
                slot: Slot::Pending,
            },
        );
    }

    /// Resolve `id` with a reply. Returns `false` if nobody is waiting for it
    /// (unknown id, already resolved, or the waiter gave up).
    pub(crate) fn fulfill(&self, id: u64, reply: Reply) -> bool {
        self.resolve(id, Slot::Fulfilled(reply))
    }

    /// Resolve `id` with an error. Same rules as [`fulfill`](Self::fulfill).
    pub(crate) fn fail(&self, id: u64, error: ObsError) -> bool {
        self.resolve(id, Slot::Failed(error))
    }

    fn resolve(&self, id: u64, outcome: Slot) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if matches!(entry.slot, Slot::Pending) => {
                entry.slot = outcome;
                drop(entries);
                let _ = self.resolved.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Fail every still-pending slot issued on `link`. Returns how many.
    pub(crate) fn fail_link(&self, link: u64, error: &ObsError) -> usize {
        let mut entries = self.entries.lock();
        let mut failed = 0;
        for entry in entries.values_mut() {
            if entry.link == link && matches!(entry.slot, Slot::Pending) {
                entry.slot = Slot::Failed(error.clone());
                failed += 1;
            }
        }
        drop(entries);
        if failed > 0 {
            let _ = self.resolved.notify_all();
        }
        failed
    }

    /// Take the outcome of `id` if it is resolved. Non-blocking.
    pub(crate) fn take_resolved(&self, id: u64) -> Option<Result<Reply>> {
        take_if_resolved(&mut self.entries.lock(), id)
    }

    /// Block until `id` resolves or `timeout` elapses.
    ///
    /// Returns `None` on timeout; the slot is removed so a late reply is
    /// discarded.
    pub(crate) fn wait(&self, id: u64, timeout: Duration) -> Option<Result<Reply>> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            if let Some(outcome) = take_if_resolved(&mut entries, id) {
                return Some(outcome);
            }
            if self.resolved.wait_until(&mut entries, deadline).timed_out() {
                let outcome = take_if_resolved(&mut entries, id);
                if outcome.is_none() {
                    let _ = entries.remove(&id);
                }
                return outcome;
            }
        }
    }

    /// Drop the slot for `id` whatever its state.
    pub(crate) fn forget(&self, id: u64) {
        let _ = self.entries.lock().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn take_if_resolved(entries: &mut HashMap<u64, Entry>, id: u64) -> Option<Result<Reply>> {
    match entries.get(&id) {
        Some(Entry {
            slot: Slot::Pending,
            ..
        }) => None,
        None => Some(Err(ObsError::Protocol(format!(
            "no pending slot for request {id}"
        )))),
        Some(_) => match entries.remove(&id).map(|entry| entry.slot) {
            Some(Slot::Fulfilled(reply)) => Some(Ok(reply)),
            Some(Slot::Failed(error)) => Some(Err(error)),
            Some(Slot::Pending) | None => None,
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::RequestStatus;

    fn response(id: u64) -> RequestResponse {
        RequestResponse {
            request_type: "GetVersion".into(),
            request_id: id.to_string(),
            request_status: RequestStatus {
                result: true,
                code: 100,
                comment: None,
            },
            response_data: None,
        }
    }

    fn lost() -> ObsError {
        ObsError::ConnectionLost {
            reason: "eof".into(),
        }
    }

    #[test]
    fn pending_is_not_resolved() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        assert!(table.take_resolved(1).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fulfilled_slot_is_taken_once() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        assert!(table.fulfill(1, Reply::Single(response(1))));
        assert_matches!(table.take_resolved(1), Some(Ok(Reply::Single(r))) if r.request_id == "1");
        assert_eq!(table.len(), 0);
        assert_matches!(table.take_resolved(1), Some(Err(ObsError::Protocol(_))));
    }

    #[test]
    fn fulfill_unknown_or_resolved_is_rejected() {
        let table = CorrelationTable::default();
        assert!(!table.fulfill(9, Reply::Single(response(9))));
        table.register(9, 1);
        assert!(table.fulfill(9, Reply::Single(response(9))));
        assert!(!table.fulfill(9, Reply::Single(response(9))));
    }

    #[test]
    fn fail_resolves_a_single_pending_slot() {
        let table = CorrelationTable::default();
        assert!(!table.fail(4, ObsError::Protocol("bad".into())));
        table.register(4, 1);
        table.register(5, 1);
        assert!(table.fail(4, ObsError::Protocol("bad".into())));
        assert!(!table.fulfill(4, Reply::Single(response(4))));
        assert_matches!(table.take_resolved(4), Some(Err(ObsError::Protocol(m))) if m == "bad");
        assert!(table.take_resolved(5).is_none());
    }

    #[test]
    fn fail_link_only_touches_that_link() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        table.register(2, 1);
        table.register(3, 2);
        assert_eq!(table.fail_link(1, &lost()), 2);
        assert_matches!(table.take_resolved(1), Some(Err(ObsError::ConnectionLost { .. })));
        assert_matches!(table.take_resolved(2), Some(Err(ObsError::ConnectionLost { .. })));
        assert!(table.take_resolved(3).is_none());
    }

    #[test]
    fn fail_link_keeps_already_fulfilled() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        assert!(table.fulfill(1, Reply::Single(response(1))));
        assert_eq!(table.fail_link(1, &lost()), 0);
        assert_matches!(table.take_resolved(1), Some(Ok(_)));
    }

    #[test]
    fn wait_times_out_and_removes_slot() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        assert!(table.wait(1, Duration::from_millis(20)).is_none());
        assert_eq!(table.len(), 0);
        assert!(!table.fulfill(1, Reply::Single(response(1))));
    }

    #[test]
    fn wait_wakes_on_fulfill_from_other_thread() {
        let table = Arc::new(CorrelationTable::default());
        table.register(1, 1);
        table.register(2, 1);

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.wait(2, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(table.fulfill(1, Reply::Single(response(1))));
        assert!(table.fulfill(2, Reply::Single(response(2))));

        let outcome = waiter.join().unwrap();
        assert_matches!(outcome, Some(Ok(Reply::Single(r))) if r.request_id == "2");
        assert_matches!(table.take_resolved(1), Some(Ok(_)));
    }

    #[test]
    fn wait_wakes_on_fail_link() {
        let table = Arc::new(CorrelationTable::default());
        table.register(7, 3);
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.wait(7, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.fail_link(3, &lost()), 1);
        assert_matches!(
            waiter.join().unwrap(),
            Some(Err(ObsError::ConnectionLost { .. }))
        );
    }

    #[test]
    fn forget_drops_slot() {
        let table = CorrelationTable::default();
        table.register(1, 1);
        table.forget(1);
        assert_eq!(table.len(), 0);
    }
}
