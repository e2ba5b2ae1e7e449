//! Connection manager
//!
//! A `Connection` starts out unconnected. `connect` opens a session and one
//! channel; `close` releases both and may be followed by another `connect`.
//! Every other operation fails with `MqError::NotConnected` while no session
//! is open, before anything is sent to the broker.
//!
//! The client performs no internal locking: all commands share the one
//! channel, so callers issuing them from several tasks must serialize them.
//! A `Subscription` only holds a weak reference to the session and is woken
//! with `MqError::ConnectionClosed` when the connection closes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::endpoint::BrokerEndpoint;
use super::message::Message;
use crate::codec;
use crate::subscription::Subscription;
use crate::topology::QueueSpec;
use crate::transport::{Channel, OutboundMessage, Transport};
use crate::utils::{MqError, Result};

/// Prefetch used when the caller has no preference.
pub const DEFAULT_PREFETCH: u16 = 1;

/// One open session with its channel. Dropped when the connection closes.
pub(crate) struct Session {
    pub(crate) channel: Box<dyn Channel>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

pub struct Connection {
    endpoint: BrokerEndpoint,
    transport: Arc<dyn Transport>,
    session: Option<Arc<Session>>,
}

impl Connection {
    pub fn new(endpoint: BrokerEndpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            session: None,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Opens the session and its channel. A no-op when already connected.
    ///
    /// On failure the connection stays unconnected; the transport releases
    /// a socket whose channel could not be opened.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            debug!(endpoint = %self.endpoint, "connect() on an open connection ignored");
            return Ok(());
        }

        let channel = self.transport.connect(&self.endpoint).await?;
        let (closed, _) = watch::channel(false);
        self.session = Some(Arc::new(Session { channel, closed }));

        info!(endpoint = %self.endpoint, "Connected to message broker");
        Ok(())
    }

    /// Releases the channel and session. Never fails; close errors are
    /// logged. Subscriptions waiting on this connection are woken.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.closed.send_replace(true);
        if let Err(e) = session.channel.close().await {
            warn!(endpoint = %self.endpoint, "Error while closing broker connection: {e}");
        }

        info!(endpoint = %self.endpoint, "Disconnected from message broker");
    }

    /// Declares the queue (and its exchange, unless it is the default one)
    /// and binds them.
    pub async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let session = self.session()?;

        if let Some(exchange) = spec.exchange_declaration() {
            session.channel.declare_exchange(&exchange).await?;
        }
        session
            .channel
            .declare_queue(&spec.queue_declaration())
            .await?;
        if let Some(binding) = spec.binding() {
            session.channel.bind_queue(&binding).await?;
        }

        debug!(
            queue = %spec.name,
            exchange = %spec.exchange_name,
            mirrored = spec.mirrored,
            ttl_seconds = spec.ttl_seconds,
            "Queue declared"
        );
        Ok(())
    }

    /// Publishes `message` to `exchange_name` (empty for the default
    /// exchange) under `routing_key`. Not retried and not confirmed.
    pub async fn send(&self, message: &Message, routing_key: &str, exchange_name: &str) -> Result<()> {
        let session = self.session()?;

        let outbound = OutboundMessage {
            exchange: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            message_id: message.id.clone(),
            body: codec::encode(&message.body)?,
            persistent: true,
        };
        session.channel.publish(outbound).await?;

        debug!(message_id = %message.id, routing_key, exchange = exchange_name, "Message sent");
        Ok(())
    }

    /// Starts consuming `queue` with at most `prefetch_count` unacknowledged
    /// deliveries in flight.
    pub async fn open(&self, queue: &str, prefetch_count: u16) -> Result<Subscription> {
        let session = self.session()?;

        if prefetch_count == 0 {
            return Err(MqError::InvalidArgument(
                "prefetch_count must be at least 1".to_string(),
            ));
        }

        let consumer_tag = format!("mqclient-{}", Uuid::new_v4());
        session.channel.qos(prefetch_count).await?;
        let stream = session.channel.consume(queue, &consumer_tag).await?;

        debug!(queue, consumer_tag = %consumer_tag, prefetch_count, "Subscription opened");
        Ok(Subscription::new(
            session,
            stream,
            queue.to_string(),
            consumer_tag,
            prefetch_count,
        ))
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session.as_ref().ok_or(MqError::NotConnected)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Dropping a connected `Connection` closes it, so scoped use releases the
/// channel on every exit path. The close handshake runs on the current
/// tokio runtime.
impl Drop for Connection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.closed.send_replace(true);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let endpoint = self.endpoint.clone();
                handle.spawn(async move {
                    if let Err(e) = session.channel.close().await {
                        warn!(endpoint = %endpoint, "Error while closing dropped connection: {e}");
                    }
                });
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, "Connection dropped outside a tokio runtime; closed without handshake");
            }
        }
    }
}
