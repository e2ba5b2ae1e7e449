//! The `client` module is the caller-facing side of `mqclient`.
//!
//! `Connection` owns one session and one channel to the broker described by
//! a `BrokerEndpoint`. Topology declaration, publishing and opening a
//! `Subscription` all go through it.

pub mod connection;
pub mod endpoint;
pub mod message;

pub use connection::{Connection, DEFAULT_PREFETCH};
pub use endpoint::BrokerEndpoint;
pub use message::Message;
