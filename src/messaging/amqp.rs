//! RabbitMQ transport on top of `lapin`.
//!
//! One `lapin::Connection` with one `lapin::Channel` per `connect()`. Queue
//! inspection uses a short-lived probe channel because a failed passive
//! declare closes the channel it runs on.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::messaging::envelope::RawMessage;
use crate::messaging::topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::messaging::transport::{
    Acknowledger, Connector, ConsumerSpec, DeliveryStream, DisconnectCallback, Flow,
    InboundDelivery, MessageProperties, QueueInfo, Transport,
};
use crate::utils::error::TransportError;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(e.into());
            }
        };
        debug!("AMQP connection and channel {} opened", channel.id());
        Ok(Arc::new(AmqpTransport {
            connection,
            channel,
        }))
    }
}

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongInt(i32::try_from(spec.message_ttl_ms).unwrap_or(i32::MAX)),
    );
    args.insert(
        ShortString::from("x-max-retries"),
        AMQPValue::LongInt(i32::try_from(spec.max_retries).unwrap_or(i32::MAX)),
    );
    args
}

fn basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(properties.content_type))
        .with_delivery_mode(if properties.persistent { 2 } else { 1 })
        .with_message_id(ShortString::from(properties.message_id))
        .with_timestamp(properties.timestamp);

    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }
    if let Some(expiration) = properties.expiration {
        props = props.with_expiration(ShortString::from(expiration));
    }
    if let Some(correlation_id) = properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in properties.headers {
            headers.insert(ShortString::from(key), AMQPValue::LongString(value.into()));
        }
        props = props.with_headers(headers);
    }
    props
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    let Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        data,
        acker,
        ..
    } = delivery;

    InboundDelivery {
        raw: RawMessage {
            delivery_tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered,
            data,
        },
        acker: Box::new(AmqpAcker(acker)),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                binding.queue,
                binding.exchange,
                binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Flow, TransportError> {
        // Publisher confirms are not enabled, so the returned confirm carries
        // nothing beyond the frame having been queued.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                basic_properties(properties),
            )
            .await?;
        Ok(Flow::Accepted)
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                &spec.queue,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_ack: spec.no_ack,
                    exclusive: spec.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|item| item.map(into_inbound).map_err(TransportError::from))
            .boxed())
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, TransportError> {
        let probe = self.connection.create_channel().await?;
        let result = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if let Err(e) = probe.close(REPLY_SUCCESS, "probe done").await {
            debug!("Probe channel close for {queue} failed: {e}");
        }

        let declared = result?;
        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        self.connection.on_error(move |err| {
            warn!("RabbitMQ connection error: {err}");
            callback(err.to_string());
        });
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        self.channel.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), TransportError> {
        self.connection.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}
