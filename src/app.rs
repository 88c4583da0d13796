//! Process wiring
//!
//! Startup mirrors how the storefront backend has always come up: bind the
//! HTTP listener first so liveness answers immediately, then bring up the
//! cache and the broker with bounded retries, then register the default
//! consumers if the broker connected. A broker or cache that never comes up
//! leaves the process running in degraded mode.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cache::CacheService;
use crate::config::{BrokerKind, Settings};
use crate::messaging::amqp::AmqpConnector;
use crate::messaging::topology::{EMAIL_QUEUE, INVENTORY_UPDATED_QUEUE, ORDER_CREATED_QUEUE};
use crate::messaging::{
    ConsumeOptions, ConsumerHandle, Connector, DomainEvent, Envelope, MemoryBroker,
    MessageService, RawMessage,
};
use crate::server::{self, AppState};

pub struct App {
    settings: Settings,
    messages: Arc<MessageService>,
    cache: Arc<CacheService>,
}

impl App {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        let messages = Arc::new(MessageService::new(connector, settings.rabbitmq.clone()));
        let cache = Arc::new(CacheService::new(settings.cache.path.clone()));
        Self {
            settings,
            messages,
            cache,
        }
    }

    /// Pick the broker client named by `broker.kind`.
    pub fn from_settings(settings: Settings) -> Self {
        let connector: Arc<dyn Connector> = match settings.broker.kind {
            BrokerKind::Amqp => Arc::new(AmqpConnector),
            BrokerKind::Memory => {
                warn!("Using the in-process broker; events stay inside this process");
                Arc::new(MemoryBroker::new())
            }
        };
        Self::new(settings, connector)
    }

    pub fn messages(&self) -> &Arc<MessageService> {
        &self.messages
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    /// Connect cache and broker with retries and register the default
    /// consumers. Never fails; whatever did not come up stays degraded.
    pub async fn initialize_services(&self) -> Vec<ConsumerHandle> {
        let policy = self.settings.startup.retry_policy();

        info!("Initializing cache connection...");
        self.cache.connect_with_retry(policy).await;

        info!("Initializing RabbitMQ connection...");
        let consumers = if self.messages.connect_with_retry(policy).await {
            register_default_consumers(&self.messages).await
        } else {
            Vec::new()
        };

        info!("All services initialized");
        consumers
    }

    pub async fn shutdown(&self) {
        self.cache.disconnect();
        self.messages.disconnect().await;
    }

    /// Serve until SIGINT/SIGTERM, then shut the services down.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let app = Arc::new(self);
        let init = {
            let app = app.clone();
            tokio::spawn(async move { app.initialize_services().await })
        };

        let served = server::serve(listener, AppState::new(), shutdown_signal()).await;
        info!("Shutdown signal received, shutting down gracefully");

        init.abort();
        app.shutdown().await;
        served.context("http server failed")
    }
}

/// Log-only consumers for the queues the backend itself listens on.
pub async fn register_default_consumers(messages: &MessageService) -> Vec<ConsumerHandle> {
    let mut handles = Vec::new();
    for queue in [ORDER_CREATED_QUEUE, EMAIL_QUEUE, INVENTORY_UPDATED_QUEUE] {
        match messages
            .consume(queue, log_event, ConsumeOptions::default())
            .await
        {
            Ok(handle) => handles.push(handle),
            Err(e) => error!("Failed to register consumer for {queue}: {e}"),
        }
    }
    handles
}

async fn log_event(envelope: Envelope, raw: RawMessage) -> anyhow::Result<()> {
    let event: DomainEvent = envelope
        .decode()
        .with_context(|| format!("unrecognised event on {}", raw.routing_key))?;

    match &event {
        DomainEvent::OrderCreated { order_id, total, .. } => {
            info!("Processing new order {order_id} (total {total})")
        }
        DomainEvent::EmailNotification { to, template, .. } => {
            info!("Sending email notification to {to} using template {template}")
        }
        DomainEvent::InventoryUpdated {
            product_id,
            new_stock,
            ..
        } => info!("Updating inventory for {product_id}: {new_stock} in stock"),
        other => info!(
            "Received {} on {} ({})",
            other.event_type(),
            raw.routing_key,
            envelope.message_id
        ),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
