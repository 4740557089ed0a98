//! Event fan-out to subscribers.
//!
//! Events go through a FIFO. Whoever drains it delivers one event at a time
//! to a snapshot of the matching subscribers, with no router lock held, so a
//! callback may subscribe, unsubscribe or issue requests. An event that
//! arrives while a drain is already running (a callback waiting on its own
//! request) is only queued; the running drain picks it up after the current
//! callback returns.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{error, trace, warn};

use crate::error::ObsError;
use crate::protocol::Event;

/// Subscriber callback.
pub type EventCallback = Arc<dyn Fn(&Event) -> Result<(), ObsError> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    category: String,
    callback: EventCallback,
}

impl Subscriber {
    /// Category name (`"Scenes"`) or exact event type.
    fn matches(&self, event: &Event) -> bool {
        self.category == event.event_type || event.category() == Some(self.category.as_str())
    }
}

#[derive(Default)]
pub(crate) struct EventRouter {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
}

impl EventRouter {
    pub(crate) fn subscribe(
        &self,
        category: impl Into<String>,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            category: category.into(),
            callback,
        });
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Queue `event` and deliver everything queued, unless a drain is
    /// already in progress.
    pub(crate) fn dispatch(&self, event: Event) {
        self.queue.lock().push_back(event);
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.queue.lock().pop_front();
                let Some(event) = next else { break };
                self.deliver(&event);
            }
            self.draining.store(false, Ordering::Release);
            // An event queued between the last pop and the store above
            // would otherwise sit until the next dispatch.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: &Event) {
        let targets: Vec<EventCallback> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.matches(event))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        trace!(event_type = %event.event_type, subscribers = targets.len(), "delivering event");

        for callback in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event_type = %event.event_type, error = %e, "event subscriber failed");
                }
                Err(payload) => {
                    error!(
                        event_type = %event.event_type,
                        panic = panic_message(payload.as_ref()),
                        "event subscriber panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
