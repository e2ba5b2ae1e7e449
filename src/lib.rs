//! # mqclient
//!
//! `mqclient` is a client for AMQP 0-9-1 message brokers such as RabbitMQ.
//! It opens one connection with one channel, declares durable queues bound
//! to direct exchanges, publishes JSON messages with a caller-supplied id and
//! consumes queues under a prefetch limit with explicit acknowledgment.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mqclient::{AmqpTransport, BrokerEndpoint, Connection, Message, QueueSpec};
//! use serde_json::json;
//!
//! # async fn run() -> mqclient::Result<()> {
//! let endpoint = BrokerEndpoint::new("guest", "guest", "localhost", 5672, "/");
//! let mut conn = Connection::new(endpoint, Arc::new(AmqpTransport::new()));
//! conn.connect().await?;
//!
//! conn.declare(&QueueSpec::new("tasks").exchange("agents").ttl_seconds(60)).await?;
//! conn.send(&Message::new("m1", json!({"x": 1})), "tasks", "agents").await?;
//!
//! let mut sub = conn.open("tasks", 1).await?;
//! if let Some(mut delivery) = sub.next().await? {
//!     delivery.ack().await?;
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `client`: `Connection`, `BrokerEndpoint` and `Message`.
//! - `topology`: `QueueSpec` and the declaration arguments it produces.
//! - `subscription`: `Subscription` and `Delivery`.
//! - `codec`: JSON body encoding.
//! - `transport`: the `Transport`/`Channel` seam and the `lapin` backend.
//! - `broker`: an in-process broker implementing `Transport`.
//! - `config`: settings from file and environment.
//! - `utils`: errors and logging.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod subscription;
pub mod topology;
pub mod transport;
pub mod utils;


pub use broker::MemoryBroker;
pub use client::{BrokerEndpoint, Connection, DEFAULT_PREFETCH, Message};
pub use subscription::{CancelHandle, Delivery, Settlement, Subscription, SubscriptionState};
pub use topology::QueueSpec;
pub use transport::{AmqpTransport, Channel, Transport};
pub use utils::{MqError, Result};
