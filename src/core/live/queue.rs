//! Bounded per-connection outbound queue. A slow client never blocks the
//! publisher: on overflow the oldest low-priority message is discarded,
//! falling back to the oldest message of any kind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use super::ServerMessage;

pub struct OutboundQueue {
    messages: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, message: ServerMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                match queue.iter().position(ServerMessage::is_low_priority) {
                    Some(pos) => {
                        queue.remove(pos);
                    }
                    None => {
                        queue.pop_front();
                    }
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Waits for the next message. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            if let Some(message) = self
                .messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::event;
    use crate::core::model::EventType;

    fn ping(ts: i64) -> ServerMessage {
        ServerMessage::Ping { ts }
    }

    fn event_new(id: &str) -> ServerMessage {
        ServerMessage::EventNew(Box::new(event("a1", id, EventType::Heartbeat, 0)))
    }

    #[tokio::test]
    async fn overflow_drops_oldest_low_priority_first() {
        let q = OutboundQueue::new(3);
        q.push(ping(1));
        q.push(event_new("e1"));
        q.push(event_new("e2"));
        q.push(ping(2));

        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 1);
        assert!(matches!(q.pop().await, Some(ServerMessage::Ping { ts: 1 })));
        match q.pop().await {
            Some(ServerMessage::EventNew(e)) => assert_eq!(e.event_id, "e2"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(q.pop().await, Some(ServerMessage::Ping { ts: 2 })));
    }

    #[tokio::test]
    async fn overflow_without_low_priority_drops_oldest() {
        let q = OutboundQueue::new(2);
        q.push(ping(1));
        q.push(ping(2));
        q.push(ping(3));
        assert!(matches!(q.pop().await, Some(ServerMessage::Ping { ts: 2 })));
        assert!(matches!(q.pop().await, Some(ServerMessage::Ping { ts: 3 })));
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_ends_on_close() {
        let q = std::sync::Arc::new(OutboundQueue::new(4));
        let reader = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.push(ping(7));
        assert!(matches!(reader.await.unwrap(), Some(ServerMessage::Ping { ts: 7 })));

        q.close();
        assert!(q.pop().await.is_none());
    }
}
