//! Consuming from a queue
//!
//! A `Subscription` pulls deliveries for one consumer registration. The
//! broker never has more than `prefetch_count` unacknowledged deliveries
//! out to it, which bounds what the client buffers. Each `Delivery` must be
//! settled exactly once with `ack`, `reject` or `requeue`; an unsettled
//! delivery holds its prefetch slot until the subscription closes.
//!
//! The pull loop belongs on its own task: `next()` waits for the broker
//! with no timeout of its own.

pub mod delivery;
pub mod subscription;

pub use delivery::{Delivery, Settlement};
pub use subscription::{CancelHandle, Subscription, SubscriptionState};

#[cfg(test)]
mod tests;
