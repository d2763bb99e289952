//! Bounded device message queue.
//!
//! Devices push discrete events (`Message`) as they arrive. The queue keeps them in arrival
//! order up to a fixed capacity and evicts the oldest entry on overflow, counting every
//! eviction. The producer never blocks and memory never grows past the capacity, no matter
//! how slowly the consumers drain it.

use crate::error::{GatorError, GatorResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

/// Category of a device message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Status report (solicited by a poll or pushed by the device)
    Status,
    /// A commanded move finished
    MotionComplete,
    /// Motion halted by a stop command
    Stopped,
    /// Homing finished
    Homed,
    /// Device-reported error; `data` carries the device-specific code
    Error,
    /// Vendor message type not interpreted by the core
    Vendor(u16),
}

/// A discrete event emitted by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message category
    pub kind: MessageKind,
    /// Device-specific message identifier
    pub id: u16,
    /// Device-specific payload
    pub data: u32,
    /// When the message was received by the link
    pub received_at: Instant,
}

/// Bounded, drop-oldest FIFO of device messages.
pub struct MessageQueue {
    entries: Mutex<VecDeque<Message>>,
    capacity: usize,
    dropped: AtomicU64,
    received: AtomicU64,
    notify: Notify,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages.
    ///
    /// # Errors
    /// `InvalidParameter` for a zero capacity.
    pub fn new(capacity: usize) -> GatorResult<Self> {
        if capacity == 0 {
            return Err(GatorError::InvalidParameter(
                "message queue capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Append a message, evicting the oldest one when full.
    ///
    /// Returns `true` when an older message was dropped to make room.
    pub fn push(&self, message: Message) -> bool {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front();
                true
            } else {
                false
            };
            entries.push_back(message);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        evicted
    }

    /// Remove and return the oldest message, if any.
    pub fn pop(&self) -> Option<Message> {
        self.entries.lock().pop_front()
    }

    /// Remove and return every queued message in arrival order.
    pub fn drain(&self) -> Vec<Message> {
        self.entries.lock().drain(..).collect()
    }

    /// Wait until a message is available and return it.
    pub async fn recv(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.pop() {
                return message;
            }
            notified.await;
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no message is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of stored messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages ever pushed, including evicted ones.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(id: u16) -> Message {
        Message {
            kind: MessageKind::Status,
            id,
            data: 0,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            MessageQueue::new(0),
            Err(GatorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn overflow_keeps_most_recent_messages() {
        let queue = MessageQueue::new(4).unwrap();
        for id in 0..10 {
            queue.push(message(id));
            assert!(queue.len() <= 4);
        }

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dropped_count(), 6);
        assert_eq!(queue.received_count(), 10);

        let ids: Vec<u16> = queue.drain().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_reports_eviction() {
        let queue = MessageQueue::new(1).unwrap();
        assert!(!queue.push(message(1)));
        assert!(queue.push(message(2)));
        assert_eq!(queue.pop().unwrap().id, 2);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_producer() {
        let queue = Arc::new(MessageQueue::new(8).unwrap());

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.push(message(42));
            })
        };

        let received = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap();
        assert_eq!(received.id, 42);
        producer.await.unwrap();
    }
}
