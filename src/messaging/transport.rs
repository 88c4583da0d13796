//! Broker client seam
//!
//! `Connector` opens a connection with a single channel and hands back a
//! `Transport`. Everything the Connection Manager, Publisher and Consumer
//! Registry do to the broker goes through these traits, so the same code
//! runs against RabbitMQ (`amqp`) and the in-process broker (`memory`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::messaging::envelope::RawMessage;
use crate::messaging::topology::{Binding, ExchangeSpec, QueueSpec};
use crate::utils::error::TransportError;

/// Broker flow-control signal returned by a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Accepted into the outbound buffer.
    Accepted,
    /// Accepted, but the caller should slow down.
    Throttled,
}

impl Flow {
    pub fn is_accepted(self) -> bool {
        matches!(self, Flow::Accepted)
    }
}

/// Per-message AMQP properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: String,
    pub message_id: String,
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub queue: String,
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

pub struct InboundDelivery {
    pub raw: RawMessage,
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, TransportError>>;

/// Invoked with a reason when the connection errors or closes underneath us.
pub type DisconnectCallback = Box<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TransportError>;

    /// Publish to `exchange`. The empty exchange name routes straight to the
    /// queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Flow, TransportError>;

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, TransportError>;

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, TransportError>;

    /// Register a callback for connection-level error or close events.
    fn on_disconnect(&self, callback: DisconnectCallback);

    fn is_open(&self) -> bool;

    async fn close_channel(&self) -> Result<(), TransportError>;

    async fn close_connection(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
