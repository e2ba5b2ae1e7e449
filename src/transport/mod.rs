//! The `transport` module is the seam between the client and the broker
//! wire protocol.
//!
//! `Transport` opens a session with a single channel on it; `Channel`
//! carries the AMQP 0-9-1 commands the client issues. `amqp::AmqpTransport`
//! speaks to a real broker through `lapin`, and `crate::broker::MemoryBroker`
//! implements the same traits in-process.

pub mod amqp;
pub mod message;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::client::BrokerEndpoint;
use crate::utils::Result;

pub use amqp::AmqpTransport;
pub use message::{
    ArgValue, Arguments, Binding, ExchangeDeclaration, OutboundMessage, QueueDeclaration,
    RawDelivery,
};

/// Deliveries pushed by the broker for one consumer, in broker order.
///
/// The stream ends when the consumer's channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session to `endpoint` and one channel on it.
    ///
    /// If the channel cannot be opened the session is released before the
    /// error is returned.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Channel>>;
}

/// One AMQP channel. Commands on a channel must not interleave, so callers
/// serialize them.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()>;

    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// basic.qos: caps unacknowledged deliveries per consumer created on
    /// this channel afterwards.
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// basic.cancel: stops deliveries to `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Closes the channel and the session that carries it.
    async fn close(&self) -> Result<()>;
}
