//! Topology declaration
//!
//! A `QueueSpec` describes a durable queue and the direct exchange it is
//! bound to. The queue name doubles as the binding's routing key. Declaring
//! the same `QueueSpec` again is a no-op on the broker; declaring it with
//! different arguments is refused by the broker.

use crate::transport::message::DIRECT;
use crate::transport::{ArgValue, Arguments, Binding, ExchangeDeclaration, QueueDeclaration};

/// Queue argument asking RabbitMQ 2.x to mirror the queue on every node.
/// RabbitMQ 3.x ignores it; mirroring there is configured by policy.
pub const HA_POLICY_ARG: &str = "x-ha-policy";

/// Queue argument: delete the queue after this many milliseconds unused.
pub const EXPIRES_ARG: &str = "x-expires";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Empty means the default exchange, which is never declared or bound.
    pub exchange_name: String,
    pub durable: bool,
    pub mirrored: bool,
    pub ttl_seconds: u32,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange_name: String::new(),
            durable: true,
            mirrored: false,
            ttl_seconds: 0,
        }
    }

    pub fn exchange(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    pub fn mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn ttl_seconds(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn arguments(&self) -> Arguments {
        let mut arguments = Arguments::new();
        if self.mirrored {
            arguments.insert(HA_POLICY_ARG.to_string(), ArgValue::Str("all".to_string()));
        }
        if self.ttl_seconds > 0 {
            arguments.insert(
                EXPIRES_ARG.to_string(),
                ArgValue::Int(i64::from(self.ttl_seconds) * 1000),
            );
        }
        arguments
    }

    pub fn exchange_declaration(&self) -> Option<ExchangeDeclaration> {
        if self.exchange_name.is_empty() {
            return None;
        }
        Some(ExchangeDeclaration {
            name: self.exchange_name.clone(),
            kind: DIRECT,
            durable: self.durable,
        })
    }

    pub fn queue_declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            durable: self.durable,
            arguments: self.arguments(),
        }
    }

    pub fn binding(&self) -> Option<Binding> {
        if self.exchange_name.is_empty() {
            return None;
        }
        Some(Binding {
            queue: self.name.clone(),
            exchange: self.exchange_name.clone(),
            routing_key: self.name.clone(),
        })
    }
}
