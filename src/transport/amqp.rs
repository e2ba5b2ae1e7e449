//! AMQP 0-9-1 transport backed by `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use tracing::{debug, warn};

use super::message::{
    ArgValue, Arguments, Binding, DIRECT, ExchangeDeclaration, OutboundMessage, QueueDeclaration,
    RawDelivery,
};
use super::{Channel, DeliveryStream, Transport};
use crate::client::BrokerEndpoint;
use crate::codec;
use crate::utils::{MqError, Result};

const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery-mode value for messages written to disk by the broker.
const PERSISTENT: u8 = 2;

/// Connects to a real broker. Holds no connection state of its own; every
/// `connect` opens a fresh session.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Channel>> {
        let uri = endpoint.amqp_uri();

        let connection = if endpoint.tls_enabled() {
            // Certificates are always verified; without a CA bundle the
            // platform roots are used.
            let cert_chain = match endpoint.ca_cert_path() {
                Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|e| {
                    MqError::Transport(format!(
                        "failed to read CA bundle {}: {e}",
                        path.display()
                    ))
                })?),
                None => None,
            };
            let tls = OwnedTLSConfig {
                identity: None,
                cert_chain,
            };
            lapin::Connection::connect_uri_with_config(uri, self.properties.clone(), tls).await
        } else {
            lapin::Connection::connect_uri(uri, self.properties.clone()).await
        }
        .map_err(|e| map_error("connection.open", e))?;

        match connection.create_channel().await {
            Ok(channel) => {
                debug!(channel_id = channel.id(), "AMQP channel opened");
                Ok(Box::new(AmqpChannel {
                    connection,
                    channel,
                }))
            }
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel open failed").await
                {
                    warn!("Failed to release AMQP connection: {close_err}");
                }
                Err(map_error("channel.open", e))
            }
        }
    }
}

struct AmqpChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        let kind = match exchange.kind {
            DIRECT => ExchangeKind::Direct,
            other => ExchangeKind::Custom(other.to_string()),
        };
        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("exchange.declare", e))
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                field_table(&queue.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error("queue.declare", e))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("queue.bind", e))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.message_id))
            .with_content_type(ShortString::from(codec::CONTENT_TYPE))
            .with_content_encoding(ShortString::from(codec::CONTENT_ENCODING));
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        // Without publisher confirms the returned confirmation resolves
        // immediately; the frame has been handed to the connection.
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error("basic.publish", e))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| map_error("basic.qos", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("basic.consume", e))?;

        Ok(consumer
            .map(|item| {
                item.map(|delivery| RawDelivery {
                    delivery_tag: delivery.delivery_tag,
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string()),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                })
                .map_err(|e| map_error("basic.deliver", e))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| map_error("basic.ack", e))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| map_error("basic.reject", e))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| map_error("basic.cancel", e))
    }

    async fn close(&self) -> Result<()> {
        // The channel may already be gone (broker closed it after a failed
        // command); the connection still has to be released.
        let channel = self.channel.close(REPLY_SUCCESS, "closing").await;
        let connection = self.connection.close(REPLY_SUCCESS, "closing").await;

        channel.map_err(|e| map_error("channel.close", e))?;
        connection.map_err(|e| map_error("connection.close", e))
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            ArgValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

/// Broker refusals become `BrokerProtocol`; everything else is a transport
/// failure.
fn map_error(operation: &'static str, err: lapin::Error) -> MqError {
    match err {
        lapin::Error::ProtocolError(amqp) => MqError::broker(operation, amqp.to_string()),
        other => MqError::Transport(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_table_carries_every_argument() {
        let mut arguments = Arguments::new();
        arguments.insert("x-ha-policy".to_string(), ArgValue::Str("all".to_string()));
        arguments.insert("x-expires".to_string(), ArgValue::Int(60_000));

        let table = field_table(&arguments);
        let inner = table.inner();
        assert_eq!(inner.len(), 2);
        assert_eq!(
            inner.get(&ShortString::from("x-expires")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert!(matches!(
            inner.get(&ShortString::from("x-ha-policy")),
            Some(AMQPValue::LongString(_))
        ));
    }

    #[test]
    fn test_non_protocol_errors_are_transport_errors() {
        let err = map_error("basic.publish", lapin::Error::ChannelsLimitReached);
        assert!(err.is_transport());
    }
}
