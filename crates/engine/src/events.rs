use gridtrade_core::BotEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Non-blocking fan-out of engine events to WebSocket subscribers.
///
/// Each subscriber has a bounded queue. On overflow the oldest lossy event
/// (price update or log line) is evicted to make room; if the queue is full
/// of must-deliver events (fills, state changes) and another arrives, the
/// subscriber is disconnected rather than silently lose one.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberQueue>>>>,
    capacity: usize,
}

struct SubscriberQueue {
    events: Mutex<VecDeque<BotEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

/// A subscriber's receiving half. Dropping it unsubscribes.
pub struct EventStream {
    queue: Arc<SubscriberQueue>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Arc::clone(&queue));
        EventStream { queue }
    }

    /// Delivers an event to every live subscriber. Never blocks.
    pub fn publish(&self, event: &BotEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|sub| {
            // Subscriber gone (stream dropped) or previously force-closed.
            if sub.closed.load(Ordering::Acquire) || Arc::strong_count(sub) == 1 {
                return false;
            }

            let mut queue = sub.events.lock().expect("event queue poisoned");
            if queue.len() < self.capacity {
                queue.push_back(event.clone());
                drop(queue);
                sub.notify.notify_one();
                return true;
            }

            // Overflow: evict the oldest lossy event if there is one.
            if let Some(position) = queue.iter().position(BotEvent::is_lossy) {
                queue.remove(position);
                queue.push_back(event.clone());
                drop(queue);
                sub.notify.notify_one();
                return true;
            }

            if event.is_lossy() {
                // Lossy incoming, queue full of critical events: drop it.
                return true;
            }

            // Critical event with nowhere to go: disconnect the subscriber.
            drop(queue);
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_one();
            tracing::warn!("event subscriber disconnected by backpressure");
            false
        });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .len()
    }
}

impl EventStream {
    /// Receives the next event; `None` once the subscriber was disconnected
    /// for backpressure and its queue has drained.
    pub async fn recv(&mut self) -> Option<BotEvent> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut events = self.queue.events.lock().expect("event queue poisoned");
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}
