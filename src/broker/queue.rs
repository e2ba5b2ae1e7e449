//! Queue management
//!
//! A `Queue` holds its declaration, the ready messages in FIFO order and
//! the consumer tags registered on it. Consumers are served round-robin.
//!
//! Callers synchronize access through the broker lock.

use std::collections::VecDeque;

use super::message::StoredMessage;
use crate::transport::QueueDeclaration;

pub type ConsumerTag = String;

#[derive(Debug)]
pub struct Queue {
    pub declaration: QueueDeclaration,
    pub ready: VecDeque<StoredMessage>,
    pub consumers: Vec<ConsumerTag>,
    next_consumer: usize,
}

impl Queue {
    pub fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Adds a consumer. Duplicate tags are ignored.
    pub fn subscribe(&mut self, tag: ConsumerTag) {
        if !self.consumers.contains(&tag) {
            self.consumers.push(tag);
        }
    }

    pub fn unsubscribe(&mut self, tag: &str) {
        self.consumers.retain(|t| t != tag);
    }

    /// Consumer tags in the order they should be offered the next message.
    pub fn rotation(&mut self) -> Vec<ConsumerTag> {
        if self.consumers.is_empty() {
            return Vec::new();
        }
        let start = self.next_consumer % self.consumers.len();
        self.next_consumer = start + 1;
        self.consumers[start..]
            .iter()
            .chain(self.consumers[..start].iter())
            .cloned()
            .collect()
    }

    /// Puts returned messages back at the head, keeping their order.
    pub fn requeue_front(&mut self, messages: Vec<StoredMessage>) {
        for mut message in messages.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}
