//! Error types for the messaging client.
//!
//! Every failure is returned to the caller as an `MqError`; the client never
//! retries or reconnects on its own. Callers tell "never connected" apart
//! from "lost the connection" by matching `NotConnected` against the
//! transport variants (`is_transport`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqError {
    /// A control, publish or consume operation was issued on a connection
    /// that is not connected.
    #[error("Not connected to the message broker")]
    NotConnected,

    /// The broker refused a command, e.g. a queue re-declared with
    /// conflicting arguments.
    #[error("Broker rejected {operation}: {reason}")]
    BrokerProtocol {
        operation: &'static str,
        reason: String,
    },

    /// Network or session failure while talking to the broker.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection went away while an operation was waiting on it.
    #[error("Connection to the message broker was closed")]
    ConnectionClosed,

    #[error("Invalid acknowledgment state: delivery {delivery_tag} was already {settled}")]
    InvalidAcknowledgmentState {
        delivery_tag: u64,
        settled: &'static str,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl MqError {
    /// True for failures of the underlying session, including a connection
    /// closed underneath a waiting operation.
    pub fn is_transport(&self) -> bool {
        matches!(self, MqError::Transport(_) | MqError::ConnectionClosed)
    }

    pub(crate) fn broker(operation: &'static str, reason: impl Into<String>) -> Self {
        MqError::BrokerProtocol {
            operation,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MqError>;
