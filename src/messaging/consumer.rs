//! Consumer Registry
//!
//! Each `consume()` call starts one broker consumer and one tokio task that
//! pulls deliveries off it one at a time. Per delivery:
//! - the body is decoded into an [`Envelope`]; a body that does not decode
//!   is rejected without requeue
//! - the handler runs to completion; `Ok` acks the message, `Err` or a panic
//!   rejects it without requeue
//!
//! Poisoned messages are never requeued here. Recovering them is left to the
//! broker's dead-lettering or to an operator.
//!
//! Registrations do not survive a disconnect: when the channel goes away the
//! delivery stream ends, the task exits and the registration is dropped from
//! [`ConsumerRegistry::registrations`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::messaging::connection::ConnectionManager;
use crate::messaging::envelope::{Envelope, RawMessage};
use crate::messaging::transport::{ConsumerSpec, DeliveryStream, InboundDelivery};
use crate::utils::error::MessagingError;

/// Processes one decoded message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope, raw: RawMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope, RawMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, raw: RawMessage) -> anyhow::Result<()> {
        (self)(envelope, raw).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Let the broker consider messages delivered on send. Off by default.
    pub no_ack: bool,
    /// Defaults to `<queue>-<uuid>`.
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    rejected: AtomicU64,
}

impl ConsumerStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.acked() + self.rejected()
    }

    fn record(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acked => self.acked.fetch_add(1, Ordering::SeqCst),
            DeliveryOutcome::Rejected => self.rejected.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// A live registration. Dropping the handle leaves the consumer running.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    stats: Arc<ConsumerStats>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// The delivery stream has ended (disconnect) or the task was aborted.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the consumer task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Consumer {} on {} ended abnormally: {e}", self.consumer_tag, self.queue);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub queue: String,
    pub consumer_tag: String,
}

#[derive(Debug)]
struct Entry {
    registration: Registration,
    active: Arc<AtomicBool>,
}

/// Moved into the consumer task; clears the registration's flag however the
/// task ends, abort included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ConsumerRegistry {
    connection: Arc<ConnectionManager>,
    registrations: Mutex<Vec<Entry>>,
}

impl ConsumerRegistry {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Attach `handler` to `queue` on the shared channel.
    pub async fn consume<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, MessagingError> {
        let transport = match self.connection.channel() {
            Ok(transport) => transport,
            Err(e) => {
                error!("RabbitMQ not connected, cannot consume from {queue}");
                return Err(e);
            }
        };

        let spec = ConsumerSpec {
            queue: queue.to_string(),
            consumer_tag: options
                .consumer_tag
                .unwrap_or_else(|| format!("{queue}-{}", Uuid::new_v4())),
            no_ack: options.no_ack,
            exclusive: options.exclusive,
        };

        let stream = transport.consume(&spec).await.map_err(|source| {
            error!("Error setting up consumer on {queue}: {source}");
            MessagingError::Consume {
                queue: queue.to_string(),
                source,
            }
        })?;

        let stats = Arc::new(ConsumerStats::default());
        let active = Arc::new(AtomicBool::new(true));
        let guard = ActiveGuard(active.clone());
        let task = tokio::spawn({
            let (spec, stats) = (spec.clone(), stats.clone());
            async move {
                let _guard = guard;
                run_consumer(spec, stream, Arc::new(handler), stats).await;
            }
        });

        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.retain(|entry| entry.active.load(Ordering::SeqCst));
        registrations.push(Entry {
            registration: Registration {
                queue: spec.queue.clone(),
                consumer_tag: spec.consumer_tag.clone(),
            },
            active,
        });
        drop(registrations);
        info!("Listening for messages on queue: {queue}");

        Ok(ConsumerHandle {
            queue: spec.queue,
            consumer_tag: spec.consumer_tag,
            stats,
            task,
        })
    }

    /// Registrations whose consumer is still running, in registration order.
    /// Consumers that ended (disconnect, stream error, abort) are pruned.
    pub fn registrations(&self) -> Vec<Registration> {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.retain(|entry| entry.active.load(Ordering::SeqCst));
        registrations
            .iter()
            .map(|entry| entry.registration.clone())
            .collect()
    }
}

async fn run_consumer(
    spec: ConsumerSpec,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<ConsumerStats>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => {
                process_delivery(&spec.queue, spec.no_ack, delivery, handler.as_ref(), &stats)
                    .await;
            }
            Err(e) => {
                error!("Consumer {} on {} failed: {e}", spec.consumer_tag, spec.queue);
                break;
            }
        }
    }
    info!("Consumer {} on {} stopped", spec.consumer_tag, spec.queue);
}

/// Decode, run the handler, then settle the delivery with the broker.
pub(crate) async fn process_delivery(
    queue: &str,
    no_ack: bool,
    delivery: InboundDelivery,
    handler: &dyn MessageHandler,
    stats: &ConsumerStats,
) -> DeliveryOutcome {
    let InboundDelivery { raw, acker } = delivery;
    let tag = raw.delivery_tag;

    let outcome = match Envelope::from_slice(&raw.data) {
        Err(e) => {
            error!("Malformed message {tag} on {queue}: {e}");
            DeliveryOutcome::Rejected
        }
        Ok(envelope) => {
            debug!("Message {} received from {queue}", envelope.message_id);
            match AssertUnwindSafe(handler.handle(envelope, raw))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => DeliveryOutcome::Acked,
                Ok(Err(e)) => {
                    error!("Error processing message {tag} from {queue}: {e:#}");
                    DeliveryOutcome::Rejected
                }
                Err(_) => {
                    error!("Handler panicked on message {tag} from {queue}");
                    DeliveryOutcome::Rejected
                }
            }
        }
    };

    if !no_ack {
        let settled = match outcome {
            DeliveryOutcome::Acked => acker.ack().await,
            DeliveryOutcome::Rejected => acker.reject(false).await,
        };
        if let Err(e) = settled {
            warn!("Failed to settle message {tag} on {queue}: {e}");
        }
    }

    stats.record(outcome);
    outcome
}
