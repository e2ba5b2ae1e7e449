//! JSON body codec.
//!
//! Message bodies travel as UTF-8 JSON text. The codec never looks inside
//! the value; it only turns it into bytes and back.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::Result;

/// Value of the AMQP `content-type` property for encoded bodies.
pub const CONTENT_TYPE: &str = "application/json";

/// Value of the AMQP `content-encoding` property for encoded bodies.
pub const CONTENT_ENCODING: &str = "utf-8";

pub fn encode<T: Serialize + ?Sized>(body: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(body)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
