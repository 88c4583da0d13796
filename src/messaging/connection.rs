//! Connection Manager
//!
//! Owns the single broker connection/channel pair of the process. Publisher
//! and Consumer Registry borrow the channel through [`ConnectionManager::channel`]
//! and never open or close it themselves.
//!
//! The connected flag is cleared by the transport's error/close callback the
//! moment the broker goes away. Nothing reconnects automatically after that;
//! an operator or supervisor has to call [`ConnectionManager::connect`] again
//! and re-issue consumer registrations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::config::RabbitMqSettings;
use crate::messaging::topology::Topology;
use crate::messaging::transport::{Connector, QueueInfo, Transport};
use crate::utils::error::MessagingError;
use crate::utils::retry::{RetryPolicy, with_retry};

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: RabbitMqSettings,
    topology: Topology,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connected: Arc<AtomicBool>,
    /// Bumped on every connect/disconnect so callbacks from a superseded
    /// connection cannot clear the flag of the current one.
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("uri", &self.settings.redacted_uri())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: RabbitMqSettings) -> Self {
        Self::with_topology(connector, settings, Topology::shopfinity())
    }

    pub fn with_topology(
        connector: Arc<dyn Connector>,
        settings: RabbitMqSettings,
        topology: Topology,
    ) -> Self {
        Self {
            connector,
            settings,
            topology,
            transport: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// True only while the flag is set and the transport still reports
    /// both connection and channel open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self
                .current()
                .is_some_and(|transport| transport.is_open())
    }

    /// The shared channel, or `NotConnected`.
    pub fn channel(&self) -> Result<Arc<dyn Transport>, MessagingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MessagingError::NotConnected);
        }
        match self.current() {
            Some(transport) if transport.is_open() => Ok(transport),
            _ => Err(MessagingError::NotConnected),
        }
    }

    /// Open the connection and channel and declare the full topology.
    ///
    /// Connecting while already connected closes the old connection first.
    ///
    /// A [`disconnect`](Self::disconnect) (or another `connect`) issued while
    /// this call is in flight supersedes it: the new transport is closed and
    /// `NotConnected` is returned.
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(previous) = self.take_transport() {
            info!("Replacing existing RabbitMQ connection");
            close_quietly(previous).await;
        }

        debug!("Connecting to {}", self.settings.redacted_uri());
        let transport = self
            .connector
            .connect(&self.settings.uri())
            .await
            .map_err(MessagingError::Connection)?;

        let connected = self.connected.clone();
        let current = self.generation.clone();
        transport.on_disconnect(Box::new(move |reason| {
            if current.load(Ordering::SeqCst) == generation {
                connected.store(false, Ordering::SeqCst);
                warn!("RabbitMQ connection closed: {reason}");
            }
        }));

        if let Err(e) = self.declare_topology(transport.as_ref()).await {
            error!("Error setting up RabbitMQ queues: {e}");
            close_quietly(transport).await;
            return Err(e);
        }

        {
            let mut slot = self
                .transport
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::SeqCst) == generation {
                *slot = Some(transport);
                self.connected.store(true, Ordering::SeqCst);
                info!("RabbitMQ connected successfully");
                return Ok(());
            }
        }

        info!("RabbitMQ connect superseded before it completed, closing it");
        close_quietly(transport).await;
        Err(MessagingError::NotConnected)
    }

    /// Bounded startup retry. Returns whether the connection came up; on
    /// `false` the process carries on with publishes and consumes failing
    /// fast.
    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> bool {
        with_retry("RabbitMQ", policy, || self.connect())
            .await
            .is_some()
    }

    /// Close channel, then connection. Close errors are logged, never
    /// returned; the flag is always false afterwards.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let transport = self.take_transport();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(transport) = transport {
            close_quietly(transport).await;
            info!("RabbitMQ disconnected");
        }
    }

    /// Message and consumer counts for `queue`; `None` when disconnected or
    /// the broker does not know the queue.
    pub async fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        let transport = self.channel().ok()?;
        match transport.queue_info(queue).await {
            Ok(info) => Some(info),
            Err(e) => {
                error!("Error getting queue info for {queue}: {e}");
                None
            }
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn declare_topology(&self, transport: &dyn Transport) -> Result<(), MessagingError> {
        for exchange in &self.topology.exchanges {
            transport
                .declare_exchange(exchange)
                .await
                .map_err(|source| MessagingError::Topology {
                    entity: format!("exchange {}", exchange.name),
                    source,
                })?;
        }

        for queue in &self.topology.queues {
            transport
                .declare_queue(queue)
                .await
                .map_err(|source| MessagingError::Topology {
                    entity: format!("queue {}", queue.name),
                    source,
                })?;
        }

        for binding in &self.topology.bindings {
            transport
                .bind_queue(binding)
                .await
                .map_err(|source| MessagingError::Topology {
                    entity: format!(
                        "binding {} -> {} ({})",
                        binding.exchange, binding.queue, binding.pattern
                    ),
                    source,
                })?;
        }

        info!("RabbitMQ queues and exchanges set up successfully");
        Ok(())
    }

    fn current(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn close_quietly(transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close_channel().await {
        warn!("Error closing RabbitMQ channel: {e}");
    }
    if let Err(e) = transport.close_connection().await {
        warn!("Error closing RabbitMQ connection: {e}");
    }
}
