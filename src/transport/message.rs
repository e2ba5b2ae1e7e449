//! Transport-neutral shapes of the commands and deliveries exchanged with
//! the broker.

use std::collections::BTreeMap;

/// Value of a broker extension argument (`x-...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgValue {
    Str(String),
    Int(i64),
}

/// Queue declaration arguments, ordered so equal declarations compare equal.
pub type Arguments = BTreeMap<String, ArgValue>;

/// Exchange type used for every declared exchange.
pub const DIRECT: &str = "direct";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: &'static str,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A basic.publish with its content properties.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

/// A basic.deliver as received, before the body is decoded.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
}
