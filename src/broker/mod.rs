//! In-process AMQP-style broker.
//!
//! `MemoryBroker` implements `Transport`, so a `Connection` can run against
//! it without a network. It keeps durable-looking state (exchanges, queues,
//! bindings) for as long as the value lives and follows the AMQP 0-9-1 rules
//! the client depends on: equivalent re-declarations succeed, inequivalent
//! ones are refused, per-consumer prefetch limits deliveries, and messages
//! unacknowledged when a channel closes are redelivered.

pub mod engine;
pub mod message;
pub mod queue;

pub use engine::MemoryBroker;
