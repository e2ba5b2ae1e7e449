//! Broker engine
//!
//! Holds all broker state behind one lock:
//! - exchanges, queues and bindings, with AMQP equivalence checks
//! - open channels, each with its prefetch and unacknowledged deliveries
//! - consumers, each fed through an unbounded channel that becomes its
//!   `DeliveryStream`
//!
//! Every transport command counts as one operation; tests use the counter
//! to prove an operation never reached the broker.
//!
//! Delivery happens inside the command that made it possible (publish, ack,
//! reject, consume, channel close), so the lock is never held across an
//! await.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use tracing::debug;

use super::message::StoredMessage;
use super::queue::{ConsumerTag, Queue};
use crate::client::BrokerEndpoint;
use crate::transport::{
    Binding, Channel, DeliveryStream, ExchangeDeclaration, OutboundMessage, QueueDeclaration,
    RawDelivery, Transport,
};
use crate::utils::{MqError, Result};

#[derive(Debug)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: ConsumerTag,
    message: StoredMessage,
}

struct Consumer {
    channel: u64,
    queue: String,
    prefetch: u16,
    sender: UnboundedSender<Result<RawDelivery>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, Queue>,
    bindings: HashSet<Binding>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<ConsumerTag, Consumer>,
    peak_unacked: HashMap<String, usize>,
    next_channel: u64,
    operations: u64,
    refuse_channels: bool,
    refused_commands: HashSet<&'static str>,
}

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("channels", &state.channels.len())
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Commands received so far, connection opens included.
    pub fn operations(&self) -> u64 {
        self.lock().operations
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn queue_declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.lock().queues.get(queue).map(|q| q.declaration.clone())
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Deliveries from `queue` that no consumer has settled yet.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Highest number of unacknowledged deliveries any single consumer of
    /// `queue` has held.
    pub fn peak_unacked(&self, queue: &str) -> usize {
        self.lock().peak_unacked.get(queue).copied().unwrap_or(0)
    }

    /// Makes subsequent channel opens fail after the session is set up.
    pub fn refuse_channels(&self, refuse: bool) {
        self.lock().refuse_channels = refuse;
    }

    /// Makes every later `operation` (for example `"basic.cancel"`) fail
    /// with a transport error until lifted again.
    pub fn refuse_command(&self, operation: &'static str, refuse: bool) {
        let mut state = self.lock();
        if refuse {
            state.refused_commands.insert(operation);
        } else {
            state.refused_commands.remove(operation);
        }
    }

    /// Drops every open channel as if the network went away.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Channel>> {
        let id = self.lock().open_channel()?;
        debug!(endpoint = %endpoint, channel = id, "In-memory channel opened");
        Ok(Box::new(MemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        let mut state = lock(&self.state);
        state.operations += 1;
        state
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        self.lock().declare_exchange(self.id, exchange)
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()> {
        self.lock().declare_queue(self.id, queue)
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.lock().bind_queue(self.id, binding)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.lock().publish(self.id, message)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.lock();
        state.channel(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.lock().consume(self.id, queue, consumer_tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.lock().settle(self.id, delivery_tag, None)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.lock().settle(self.id, delivery_tag, Some(requeue))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.lock().cancel(self.id, consumer_tag)
    }

    async fn close(&self) -> Result<()> {
        self.lock().close_channel(self.id);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        lock(&self.state).close_channel(self.id);
    }
}

impl BrokerState {
    fn open_channel(&mut self) -> Result<u64> {
        self.operations += 1;
        if self.refuse_channels {
            return Err(MqError::Transport(
                "channel.open: connection closed by broker".to_string(),
            ));
        }
        self.next_channel += 1;
        let id = self.next_channel;
        self.channels.insert(
            id,
            ChannelState {
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn check_refused(&self, operation: &'static str) -> Result<()> {
        if self.refused_commands.contains(operation) {
            return Err(MqError::Transport(format!(
                "{operation}: connection reset by peer"
            )));
        }
        Ok(())
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| MqError::Transport(format!("channel {id} is closed")))
    }

    fn declare_exchange(&mut self, channel: u64, exchange: &ExchangeDeclaration) -> Result<()> {
        self.channel(channel)?;
        if exchange.name.is_empty() {
            return Err(MqError::broker(
                "exchange.declare",
                "ACCESS_REFUSED - operation not permitted on the default exchange",
            ));
        }
        match self.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(MqError::broker(
                "exchange.declare",
                format!(
                    "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                    exchange.name
                ),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, channel: u64, queue: &QueueDeclaration) -> Result<()> {
        self.channel(channel)?;
        match self.queues.get(&queue.name) {
            Some(existing) if existing.declaration != *queue => Err(MqError::broker(
                "queue.declare",
                format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue.name
                ),
            )),
            Some(_) => Ok(()),
            None => {
                self.queues
                    .insert(queue.name.clone(), Queue::new(queue.clone()));
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, channel: u64, binding: &Binding) -> Result<()> {
        self.channel(channel)?;
        if !self.exchanges.contains_key(&binding.exchange) {
            return Err(not_found("queue.bind", "exchange", &binding.exchange));
        }
        if !self.queues.contains_key(&binding.queue) {
            return Err(not_found("queue.bind", "queue", &binding.queue));
        }
        self.bindings.insert(binding.clone());
        Ok(())
    }

    fn publish(&mut self, channel: u64, message: OutboundMessage) -> Result<()> {
        self.channel(channel)?;

        let targets: Vec<String> = if message.exchange.is_empty() {
            // default exchange: every queue is bound under its own name
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            if !self.exchanges.contains_key(&message.exchange) {
                return Err(not_found("basic.publish", "exchange", &message.exchange));
            }
            self.bindings
                .iter()
                .filter(|b| b.exchange == message.exchange && b.routing_key == message.routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Unroutable message dropped"
            );
        }

        let stored = StoredMessage {
            message_id: Some(message.message_id),
            body: message.body,
            redelivered: false,
        };
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(stored.clone());
            }
            self.dispatch(&target);
        }
        Ok(())
    }

    fn consume(&mut self, channel: u64, queue: &str, tag: &str) -> Result<DeliveryStream> {
        let prefetch = self.channel(channel)?.prefetch;
        if !self.queues.contains_key(queue) {
            return Err(not_found("basic.consume", "queue", queue));
        }
        if self.consumers.contains_key(tag) {
            return Err(MqError::broker(
                "basic.consume",
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
            ));
        }

        let (sender, receiver) = unbounded();
        self.consumers.insert(
            tag.to_string(),
            Consumer {
                channel,
                queue: queue.to_string(),
                prefetch,
                sender,
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.subscribe(tag.to_string());
        }
        self.dispatch(queue);

        Ok(receiver.boxed())
    }

    /// `requeue`: `None` acknowledges, `Some(_)` rejects.
    fn settle(&mut self, channel: u64, delivery_tag: u64, requeue: Option<bool>) -> Result<()> {
        let operation = if requeue.is_some() {
            "basic.reject"
        } else {
            "basic.ack"
        };
        self.check_refused(operation)?;
        let unacked = self
            .channel(channel)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                MqError::broker(
                    operation,
                    format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
                )
            })?;

        if requeue == Some(true) {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue_front(vec![unacked.message]);
            }
        }
        self.dispatch(&unacked.queue);
        Ok(())
    }

    fn cancel(&mut self, channel: u64, tag: &str) -> Result<()> {
        self.check_refused("basic.cancel")?;
        self.channel(channel)?;
        // cancelling an unknown tag is a no-op in AMQP
        if self.consumers.get(tag).is_some_and(|c| c.channel == channel) {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.unsubscribe(tag);
                }
            }
        }
        Ok(())
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &tags {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.unsubscribe(tag);
                }
            }
        }

        let mut returned: BTreeMap<String, Vec<StoredMessage>> = BTreeMap::new();
        for (_, unacked) in state.unacked {
            returned
                .entry(unacked.queue)
                .or_default()
                .push(unacked.message);
        }
        for (queue_name, messages) in returned {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.requeue_front(messages);
            }
            self.dispatch(&queue_name);
        }
    }

    /// Hands ready messages of `queue_name` to consumers with free prefetch
    /// slots.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }

            let mut chosen = None;
            for tag in queue.rotation() {
                let Some(consumer) = self.consumers.get(&tag) else {
                    continue;
                };
                let in_flight = self
                    .channels
                    .get(&consumer.channel)
                    .map_or(0, |c| c.unacked.values().filter(|u| u.consumer == tag).count());
                if consumer.prefetch == 0 || in_flight < usize::from(consumer.prefetch) {
                    chosen = Some((tag, in_flight));
                    break;
                }
            }
            let Some((tag, in_flight)) = chosen else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let Some(consumer) = self.consumers.get(&tag) else {
                return;
            };
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                return;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if consumer
                .sender
                .unbounded_send(Ok(message.to_delivery(delivery_tag)))
                .is_err()
            {
                // the consumer's stream was dropped; forget it and retry
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(message);
                    queue.unsubscribe(&tag);
                }
                self.consumers.remove(&tag);
                continue;
            }

            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer: tag,
                    message,
                },
            );
            let peak = self.peak_unacked.entry(queue_name.to_string()).or_default();
            *peak = (*peak).max(in_flight + 1);
        }
    }
}

fn not_found(operation: &'static str, kind: &str, name: &str) -> MqError {
    MqError::broker(operation, format!("NOT_FOUND - no {kind} '{name}'"))
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
