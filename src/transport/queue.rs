//! Outbound message queue.
//!
//! Every `emit` lands here first. The manager drains the queue whenever a
//! transport is available, one batch at a time, so delivery follows enqueue
//! order.

use std::collections::VecDeque;
use std::future::Future;

use crate::core::{OutboundMessage, QueueOverflow, SendError, SendRequest};

/// Bounded FIFO of messages awaiting delivery.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` messages (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message.
    ///
    /// Always succeeds. When the queue is full the oldest non-critical
    /// message (or, if every message is critical, the oldest one) is evicted
    /// and returned as an overflow report.
    pub fn enqueue(&mut self, message: OutboundMessage) -> Option<QueueOverflow> {
        let overflow = if self.messages.len() >= self.capacity {
            self.evict()
        } else {
            None
        };
        self.messages.push_back(message);
        overflow
    }

    /// Take everything currently queued, oldest first.
    pub fn take_batch(&mut self) -> Vec<OutboundMessage> {
        self.messages.drain(..).collect()
    }

    /// Put undelivered messages back at the head, ahead of anything queued
    /// since they were taken, preserving their order.
    ///
    /// Returns one overflow report per message evicted to respect capacity,
    /// using the same eviction order as [`enqueue`](Self::enqueue).
    pub fn restore(&mut self, remainder: Vec<OutboundMessage>) -> Vec<QueueOverflow> {
        for message in remainder.into_iter().rev() {
            self.messages.push_front(message);
        }

        let mut overflows = Vec::new();
        while self.messages.len() > self.capacity {
            match self.evict() {
                Some(overflow) => overflows.push(overflow),
                None => break,
            }
        }
        overflows
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }

    /// Evict the oldest non-critical message, or the oldest one when every
    /// queued message is critical.
    fn evict(&mut self) -> Option<QueueOverflow> {
        let index = self.messages.iter().position(|m| !m.critical).unwrap_or(0);

        self.messages.remove(index).map(|dropped| QueueOverflow {
            capacity: self.capacity,
            dropped,
        })
    }
}

/// Outcome of one [`flush_batch`] run.
#[derive(Debug)]
pub struct FlushReport {
    /// Messages delivered, in order.
    pub sent: usize,
    /// The message whose send failed, with the error; `None` if all went out.
    pub failed: Option<(OutboundMessage, SendError)>,
    /// Messages after the failed one that were never attempted.
    pub remainder: Vec<OutboundMessage>,
}

/// Send `batch` strictly in order, stopping at the first failure.
pub async fn flush_batch<F, Fut>(batch: Vec<OutboundMessage>, mut send: F) -> FlushReport
where
    F: FnMut(SendRequest) -> Fut,
    Fut: Future<Output = Result<(), SendError>>,
{
    let mut pending = VecDeque::from(batch);
    let mut sent = 0;

    while let Some(message) = pending.pop_front() {
        if let Err(error) = send(SendRequest::from(&message)).await {
            return FlushReport {
                sent,
                failed: Some((message, error)),
                remainder: pending.into(),
            };
        }
        sent += 1;
    }

    FlushReport {
        sent,
        failed: None,
        remainder: Vec::new(),
    }
}
