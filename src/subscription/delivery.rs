use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::connection::Session;
use crate::utils::{MqError, Result};

/// Delivery tags handed out by a subscription and not yet settled.
pub(crate) type InFlight = Arc<Mutex<BTreeSet<u64>>>;

/// How a delivery was finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acknowledged,
    Rejected,
    Requeued,
    /// Handed back to the broker when the subscription closed.
    Returned,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Acknowledged => "acknowledged",
            Settlement::Rejected => "rejected",
            Settlement::Requeued => "requeued",
            Settlement::Returned => "returned to the broker",
        }
    }
}

/// One message delivered to a subscription.
#[derive(Debug)]
pub struct Delivery {
    delivery_tag: u64,
    id: Option<String>,
    body: Value,
    redelivered: bool,
    received_at: DateTime<Utc>,
    settled: Option<Settlement>,
    session: Weak<Session>,
    in_flight: InFlight,
}

impl Delivery {
    pub(crate) fn new(
        delivery_tag: u64,
        id: Option<String>,
        body: Value,
        redelivered: bool,
        session: Weak<Session>,
        in_flight: InFlight,
    ) -> Self {
        Self {
            delivery_tag,
            id,
            body,
            redelivered,
            received_at: Utc::now(),
            settled: None,
            session,
            in_flight,
        }
    }

    /// The publisher's message id, if it set one.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Decode the body into a concrete type.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.body)?)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// True when the broker delivered this message before without it being
    /// acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn settlement(&self) -> Option<Settlement> {
        self.settled.or_else(|| {
            // closed subscriptions hand unsettled deliveries back
            (!lock(&self.in_flight).contains(&self.delivery_tag)).then_some(Settlement::Returned)
        })
    }

    /// Tells the broker the message is fully processed, freeing a prefetch
    /// slot.
    pub async fn ack(&mut self) -> Result<()> {
        self.settle(Settlement::Acknowledged).await
    }

    /// Tells the broker the message was not processed. It is not requeued;
    /// broker policy decides whether it is dead-lettered or dropped.
    pub async fn reject(&mut self) -> Result<()> {
        self.settle(Settlement::Rejected).await
    }

    /// Rejects the message and asks the broker to deliver it again.
    pub async fn requeue(&mut self) -> Result<()> {
        self.settle(Settlement::Requeued).await
    }

    async fn settle(&mut self, how: Settlement) -> Result<()> {
        if let Some(previous) = self.settled {
            return Err(self.already(previous));
        }
        if !lock(&self.in_flight).remove(&self.delivery_tag) {
            return Err(self.already(Settlement::Returned));
        }

        let outcome = match self.session.upgrade() {
            Some(session) => match how {
                Settlement::Acknowledged => session.channel.ack(self.delivery_tag).await,
                Settlement::Rejected => session.channel.reject(self.delivery_tag, false).await,
                _ => session.channel.reject(self.delivery_tag, true).await,
            },
            None => Err(MqError::ConnectionClosed),
        };

        match outcome {
            Ok(()) => {
                self.settled = Some(how);
                Ok(())
            }
            Err(e) => {
                // not settled; give the slot back so the caller may try again
                lock(&self.in_flight).insert(self.delivery_tag);
                Err(e)
            }
        }
    }

    fn already(&self, settled: Settlement) -> MqError {
        MqError::InvalidAcknowledgmentState {
            delivery_tag: self.delivery_tag,
            settled: settled.as_str(),
        }
    }
}

pub(crate) fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}
