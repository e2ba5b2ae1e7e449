//! Messages at rest in a broker queue.

use crate::transport::RawDelivery;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn to_delivery(&self, delivery_tag: u64) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            message_id: self.message_id.clone(),
            redelivered: self.redelivered,
            body: self.body.clone(),
        }
    }
}
