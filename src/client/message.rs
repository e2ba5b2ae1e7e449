//! Outgoing message
//!
//! `id` is supplied by the caller and travels in the AMQP `message-id`
//! property; `body` is any JSON value and is never inspected here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub body: Value,
}

impl Message {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Build a message from any serializable body.
    pub fn from_serialize<T: Serialize>(id: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self::new(id, serde_json::to_value(body)?))
    }

    /// Message with a fresh UUID v4 as its id.
    pub fn with_random_id(body: Value) -> Self {
        Self::new(Uuid::new_v4().to_string(), body)
    }
}
