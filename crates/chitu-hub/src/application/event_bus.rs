//! In-memory publish/subscribe of [`HubEvent`]s with one bounded queue per
//! subscriber.
//!
//! # Why not a broadcast channel? (for beginners)
//!
//! `tokio::sync::broadcast` shares one ring buffer between all receivers.
//! When a slow receiver lags, it loses the *oldest* events regardless of
//! what they are, so a slow browser tab could miss a "command failed" event
//! just because twenty status updates arrived after it.
//!
//! Here every subscriber owns its own queue:
//!
//! ```text
//!               publish(event)
//!                     │  (clone the subscriber list, release the map lock)
//!         ┌───────────┼───────────┐
//!         ▼           ▼           ▼
//!    [queue A]    [queue B]    [queue C]     each: Mutex<VecDeque> + Notify
//!         │           │           │
//!     browser A   browser B   browser C
//! ```
//!
//! Pushing into a queue only takes that queue's own short lock and never
//! waits for the consumer, so a stalled subscriber cannot slow down the
//! others.  When a queue is full:
//!
//! 1. the oldest *droppable* event (status or upload progress) is evicted;
//! 2. if the queue holds no droppable event and the new event is droppable,
//!    the new event is discarded;
//! 3. a *must-deliver* event (command result, connectivity, toast, registry)
//!    is always enqueued, even past capacity.
//!
//! Events that survive keep their publish order (FIFO per subscriber).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chitu_core::{HubEvent, PrinterId};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::lock;

/// Identifier of one UI session.
pub type SessionId = Uuid;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Result of offering one event to one subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older droppable event.
    QueuedWithEviction,
    /// Queued beyond capacity (only must-deliver events).
    Overflowed,
    /// The new (droppable) event was discarded.
    Dropped,
    /// The subscriber's filter excludes this event.
    Filtered,
    /// The subscriber is gone.
    Closed,
}

struct QueueState {
    events: VecDeque<HubEvent>,
    filter: Option<HashSet<PrinterId>>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize, filter: Option<HashSet<PrinterId>>) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(1024)),
                filter,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: &HubEvent) -> PushOutcome {
        let outcome = {
            let mut st = lock(&self.state);
            if st.closed {
                return PushOutcome::Closed;
            }
            if let (Some(filter), Some(printer)) = (&st.filter, event.printer_id()) {
                if !filter.contains(printer) {
                    return PushOutcome::Filtered;
                }
            }

            if st.events.len() < self.capacity {
                st.events.push_back(event.clone());
                PushOutcome::Queued
            } else if let Some(pos) = st.events.iter().position(HubEvent::is_droppable) {
                st.events.remove(pos);
                st.dropped += 1;
                st.events.push_back(event.clone());
                PushOutcome::QueuedWithEviction
            } else if event.is_droppable() {
                st.dropped += 1;
                PushOutcome::Dropped
            } else {
                st.events.push_back(event.clone());
                PushOutcome::Overflowed
            }
        };
        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

/// Receiving end of one subscription.
///
/// Dropping the subscription closes its queue; the bus forgets closed queues
/// on the next publish.
pub struct Subscription {
    session_id: SessionId,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Waits for the next event.  Returns `None` once the subscription has
    /// been closed and drained.
    pub async fn recv(&self) -> Option<HubEvent> {
        loop {
            {
                let mut st = lock(&self.queue.state);
                if let Some(ev) = st.events.pop_front() {
                    return Some(ev);
                }
                if st.closed {
                    return None;
                }
            }
            // `notify_one` stores a permit when nobody is waiting, so a push
            // between the check above and this await is not lost.
            self.queue.notify.notified().await;
        }
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&self) -> Option<HubEvent> {
        lock(&self.queue.state).events.pop_front()
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        lock(&self.queue.state).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        lock(&self.queue.state).dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// The hub-wide event bus.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<HashMap<SessionId, Arc<SubscriberQueue>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `session_id`.  A `filter` restricts printer-scoped events to
    /// the given printers; events without a printer are always delivered.
    ///
    /// Subscribing an id that is already registered closes the old queue.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        filter: Option<HashSet<PrinterId>>,
    ) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.capacity, filter));
        let previous = lock(&self.subscribers).insert(session_id, Arc::clone(&queue));
        if let Some(old) = previous {
            old.close();
        }
        debug!("subscriber {session_id} registered");
        Subscription { session_id, queue }
    }

    /// Removes `session_id`.  Returns `false` if it was not registered.
    pub fn unsubscribe(&self, session_id: SessionId) -> bool {
        let removed = lock(&self.subscribers).remove(&session_id);
        match removed {
            Some(queue) => {
                queue.close();
                debug!("subscriber {session_id} removed");
                true
            }
            None => false,
        }
    }

    /// Replaces the printer filter of an existing subscriber.
    pub fn set_filter(&self, session_id: SessionId, filter: Option<HashSet<PrinterId>>) -> bool {
        let queue = lock(&self.subscribers).get(&session_id).cloned();
        match queue {
            Some(q) => {
                lock(&q.state).filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Offers `event` to every subscriber without waiting on any of them.
    ///
    /// Returns the number of subscribers that queued the event.
    pub fn publish(&self, event: HubEvent) -> usize {
        let targets: Vec<(SessionId, Arc<SubscriberQueue>)> = lock(&self.subscribers)
            .iter()
            .map(|(id, q)| (*id, Arc::clone(q)))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, queue) in &targets {
            match queue.push(&event) {
                PushOutcome::Queued | PushOutcome::QueuedWithEviction => delivered += 1,
                PushOutcome::Overflowed => {
                    delivered += 1;
                    warn!(
                        "subscriber {id} queue over capacity; kept must-deliver {} event",
                        event.name()
                    );
                }
                PushOutcome::Dropped => debug!("subscriber {id} queue full; dropped {}", event.name()),
                PushOutcome::Filtered => {}
                PushOutcome::Closed => closed.push((*id, Arc::clone(queue))),
            }
        }

        if !closed.is_empty() {
            let mut subs = lock(&self.subscribers);
            for (id, queue) in closed {
                // Only forget the exact queue we saw closed; the id may have
                // re-subscribed in the meantime.
                if subs.get(&id).is_some_and(|q| Arc::ptr_eq(q, &queue)) {
                    subs.remove(&id);
                }
            }
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
