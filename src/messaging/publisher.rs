//! Publisher
//!
//! Wraps a payload in an [`Envelope`], serializes it and hands it to the
//! shared channel either through an exchange or straight to a queue.
//! Publishing while disconnected fails fast with `NotConnected` and touches
//! nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::messaging::connection::ConnectionManager;
use crate::messaging::envelope::Envelope;
use crate::messaging::transport::{Flow, MessageProperties};
use crate::utils::error::MessagingError;

/// The default exchange; routing key is the destination queue name.
const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Survive a broker restart. On by default.
    pub persistent: bool,
    pub content_type: String,
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds, as the AMQP string property.
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            content_type: "application/json".to_string(),
            priority: None,
            expiration: None,
            correlation_id: None,
            headers: BTreeMap::new(),
        }
    }
}

impl PublishOptions {
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms.to_string());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn into_properties(self, message_id: String) -> MessageProperties {
        MessageProperties {
            persistent: self.persistent,
            content_type: self.content_type,
            message_id,
            timestamp: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
            priority: self.priority,
            expiration: self.expiration,
            correlation_id: self.correlation_id,
            headers: self.headers,
        }
    }
}

/// Serialize `payload` and require a JSON object.
pub fn to_object<T: Serialize + ?Sized>(payload: &T) -> Result<Map<String, Value>, MessagingError> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(MessagingError::InvalidPayload("null")),
        Value::Bool(_) => Err(MessagingError::InvalidPayload("a boolean")),
        Value::Number(_) => Err(MessagingError::InvalidPayload("a number")),
        Value::String(_) => Err(MessagingError::InvalidPayload("a string")),
        Value::Array(_) => Err(MessagingError::InvalidPayload("an array")),
    }
}

#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Publish `payload` to `exchange` with `routing_key`.
    ///
    /// `Ok(Flow::Throttled)` means the broker took the message but wants the
    /// caller to slow down.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<Flow, MessagingError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let target = format!("{exchange}:{routing_key}");
        let flow = self
            .deliver(exchange, routing_key, payload, options, &target)
            .await?;
        if flow.is_accepted() {
            info!("Message published to {target}");
        }
        Ok(flow)
    }

    /// Send `payload` directly to `queue`, bypassing exchange routing.
    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<Flow, MessagingError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let target = format!("queue {queue}");
        let flow = self
            .deliver(DEFAULT_EXCHANGE, queue, payload, options, &target)
            .await?;
        if flow.is_accepted() {
            info!("Message sent to {target}");
        }
        Ok(flow)
    }

    async fn deliver<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
        target: &str,
    ) -> Result<Flow, MessagingError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let transport = match self.connection.channel() {
            Ok(transport) => transport,
            Err(e) => {
                error!("RabbitMQ not connected, dropping message for {target}");
                return Err(e);
            }
        };

        let envelope = Envelope::wrap(to_object(payload)?);
        let body = envelope.to_vec()?;
        let properties = options.into_properties(envelope.message_id);

        let flow = transport
            .publish(exchange, routing_key, body, properties)
            .await
            .map_err(|source| {
                error!("Error publishing message to {target}: {source}");
                MessagingError::Publish {
                    target: target.to_string(),
                    source,
                }
            })?;

        if flow == Flow::Throttled {
            warn!("Broker asked to throttle after publishing to {target}");
        }
        Ok(flow)
    }
}
