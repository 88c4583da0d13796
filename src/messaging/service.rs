use std::sync::Arc;

use serde::Serialize;

use crate::config::RabbitMqSettings;
use crate::messaging::connection::ConnectionManager;
use crate::messaging::consumer::{ConsumeOptions, ConsumerHandle, ConsumerRegistry, MessageHandler};
use crate::messaging::events::EventPublisher;
use crate::messaging::publisher::{PublishOptions, Publisher};
use crate::messaging::transport::{Connector, Flow, QueueInfo};
use crate::utils::error::MessagingError;
use crate::utils::retry::RetryPolicy;

/// The messaging layer of one process.
///
/// Build one at startup, share it behind an `Arc` with every call site, and
/// call [`disconnect`](Self::disconnect) on shutdown. All parts share the
/// same [`ConnectionManager`] and therefore the same channel.
#[derive(Debug)]
pub struct MessageService {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    consumers: ConsumerRegistry,
    events: EventPublisher,
}

impl MessageService {
    pub fn new(connector: Arc<dyn Connector>, settings: RabbitMqSettings) -> Self {
        Self::from_connection(Arc::new(ConnectionManager::new(connector, settings)))
    }

    pub fn from_connection(connection: Arc<ConnectionManager>) -> Self {
        let publisher = Publisher::new(connection.clone());
        Self {
            consumers: ConsumerRegistry::new(connection.clone()),
            events: EventPublisher::new(publisher.clone()),
            publisher,
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn connect(&self) -> Result<(), MessagingError> {
        self.connection.connect().await
    }

    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> bool {
        self.connection.connect_with_retry(policy).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

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
        self.publisher
            .publish(exchange, routing_key, payload, options)
            .await
    }

    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<Flow, MessagingError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publisher.send_to_queue(queue, payload, options).await
    }

    pub async fn consume<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, MessagingError> {
        self.consumers.consume(queue, handler, options).await
    }

    pub async fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        self.connection.queue_info(queue).await
    }
}
