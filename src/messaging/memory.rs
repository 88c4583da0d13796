//! In-process topic broker
//!
//! `MemoryBroker` implements the same `Connector`/`Transport` seam as the AMQP
//! client so the service can run, and be tested, without RabbitMQ. It keeps
//! the parts of broker behaviour the messaging layer relies on:
//! - durable declarations are idempotent, and re-declaring an entity with
//!   different parameters fails the way RabbitMQ's `PRECONDITION_FAILED` does
//! - topic routing with `*`/`#` patterns, plus the default exchange (`""`)
//!   routing straight to a queue by name
//! - per-queue FIFO, round-robin dispatch across consumers
//! - unacked deliveries are tracked by delivery tag until acked or rejected;
//!   rejected-without-requeue messages land in a dead-letter list
//! - when a connection drops, its consumers go away and its unacked
//!   deliveries are requeued flagged as redelivered
//!
//! Failure injection (`refuse_connections`, `drop_connections`,
//! `set_throttled`) exists for exercising the degraded paths.
//!
//! Concurrency: state lives behind one `std::sync::Mutex`. The lock is never
//! held across an `.await`, and disconnect callbacks run after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messaging::envelope::RawMessage;
use crate::messaging::topology::{Binding, ExchangeSpec, QueueSpec, topic_matches};
use crate::messaging::transport::{
    Acknowledger, Connector, ConsumerSpec, DeliveryStream, DisconnectCallback, Flow,
    InboundDelivery, MessageProperties, QueueInfo, Transport,
};
use crate::utils::error::TransportError;

type DeliverySender = mpsc::UnboundedSender<Result<InboundDelivery, TransportError>>;

/// A message as the broker holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub queue: String,
    pub message: BrokerMessage,
}

struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    no_ack: bool,
    exclusive: bool,
    sender: DeliverySender,
}

struct QueueState {
    spec: QueueSpec,
    /// (exchange, pattern)
    bindings: Vec<(String, String)>,
    ready: VecDeque<BrokerMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            bindings: Vec::new(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
    }
}

struct Unacked {
    queue: String,
    connection_id: u64,
    message: BrokerMessage,
}

struct ConnectionShared {
    open: AtomicBool,
    channel_open: AtomicBool,
    callbacks: Mutex<Vec<DisconnectCallback>>,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            channel_open: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, reason: &str) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(reason.to_string());
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<DeadLetter>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    acked: u64,
    refuse_connects: u32,
    throttled: bool,
}

impl BrokerState {
    fn dispatch(&mut self, queue_name: &str, broker: &MemoryBroker) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let idx = queue.next_consumer % queue.consumers.len();
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;

            let slot = &queue.consumers[idx];
            let (no_ack, connection_id) = (slot.no_ack, slot.connection_id);
            let delivery = InboundDelivery {
                raw: RawMessage {
                    delivery_tag: tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    data: message.body.clone(),
                },
                acker: Box::new(MemoryAcker {
                    broker: broker.clone(),
                    tag,
                }),
            };

            if slot.sender.send(Ok(delivery)).is_err() {
                debug!("Consumer {} on {queue_name} went away", slot.tag);
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }
            queue.next_consumer = idx + 1;

            if no_ack {
                self.acked += 1;
            } else {
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        connection_id,
                        message,
                    },
                );
            }
        }
    }

    /// Drop a connection's consumers and requeue what it had in flight.
    /// Returns the queues that need a dispatch pass.
    fn release(&mut self, connection_id: u64) -> Vec<String> {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection_id != connection_id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first so push_front restores the original order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                    if !touched.contains(&unacked.queue) {
                        touched.push(unacked.queue);
                    }
                }
            }
        }
        touched
    }
}

/// Cloneable handle to one in-process broker; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.state().refuse_connects = count;
    }

    /// While set, publishes are still routed but report `Flow::Throttled`.
    pub fn set_throttled(&self, throttled: bool) {
        self.state().throttled = throttled;
    }

    /// Simulate the broker severing every open connection.
    pub fn drop_connections(&self, reason: &str) {
        let dropped: Vec<Arc<ConnectionShared>> = {
            let mut state = self.state();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let mut dropped = Vec::new();
            let mut touched = Vec::new();
            for id in ids {
                if let Some(conn) = state.connections.remove(&id) {
                    conn.open.store(false, Ordering::SeqCst);
                    conn.channel_open.store(false, Ordering::SeqCst);
                    touched.extend(state.release(id));
                    dropped.push(conn);
                }
            }
            for queue in touched {
                state.dispatch(&queue, self);
            }
            dropped
        };

        for conn in dropped {
            conn.notify(reason);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.state().queues.get(name).map(|q| q.spec.clone())
    }

    /// (exchange, pattern) pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// Messages waiting in `queue` that have not been delivered.
    pub fn ready_messages(&self, queue: &str) -> Vec<BrokerMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn acked_count(&self) -> u64 {
        self.state().acked
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    fn settle(&self, tag: u64, outcome: Settle) -> Result<(), TransportError> {
        let mut state = self.state();
        let Some(mut unacked) = state.unacked.remove(&tag) else {
            return Err(TransportError::PreconditionFailed(format!(
                "unknown delivery tag {tag}"
            )));
        };

        match outcome {
            Settle::Ack => state.acked += 1,
            Settle::Reject { requeue: false } => state.dead_letters.push(DeadLetter {
                queue: unacked.queue,
                message: unacked.message,
            }),
            Settle::Reject { requeue: true } => {
                let queue_name = unacked.queue.clone();
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                }
                state.dispatch(&queue_name, self);
            }
        }
        Ok(())
    }
}

enum Settle {
    Ack,
    Reject { requeue: bool },
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker.settle(self.tag, Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.broker.settle(self.tag, Settle::Reject { requeue })
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let mut state = self.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Refused(format!("{uri} refused by test broker")));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let shared = Arc::new(ConnectionShared::new());
        state.connections.insert(id, shared.clone());
        debug!("In-memory broker accepted connection {id}");

        Ok(Arc::new(MemoryTransport {
            id,
            broker: self.clone(),
            shared,
        }))
    }
}

pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    shared: Arc<ConnectionShared>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.exchanges.get(spec.name) {
            Some(existing) if existing != spec => Err(TransportError::PreconditionFailed(
                format!("inequivalent arguments for exchange '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.to_string(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        match state.queues.get(spec.name) {
            Some(existing) if existing.spec != *spec => Err(TransportError::PreconditionFailed(
                format!("inequivalent arguments for queue '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.to_string(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(binding.exchange) {
            return Err(TransportError::NotFound(format!(
                "exchange '{}'",
                binding.exchange
            )));
        }
        let Some(queue) = state.queues.get_mut(binding.queue) else {
            return Err(TransportError::NotFound(format!("queue '{}'", binding.queue)));
        };

        let entry = (binding.exchange.to_string(), binding.pattern.to_string());
        if !queue.bindings.contains(&entry) {
            queue.bindings.push(entry);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Flow, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();

        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            if !state.exchanges.contains_key(exchange) {
                return Err(TransportError::NotFound(format!("exchange '{exchange}'")));
            }
            state
                .queues
                .iter()
                .filter(|(_, q)| q.routes(exchange, routing_key))
                .map(|(name, _)| name.clone())
                .collect()
        };

        if targets.is_empty() {
            warn!("Message to {exchange}:{routing_key} was unroutable and dropped");
        }

        let message = BrokerMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
            redelivered: false,
        };
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
            state.dispatch(name, &self.broker);
        }

        Ok(if state.throttled {
            Flow::Throttled
        } else {
            Flow::Accepted
        })
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let Some(queue) = state.queues.get_mut(&spec.queue) else {
            return Err(TransportError::NotFound(format!("queue '{}'", spec.queue)));
        };
        if !queue.consumers.is_empty() && (spec.exclusive || queue.consumers.iter().any(|c| c.exclusive)) {
            return Err(TransportError::PreconditionFailed(format!(
                "queue '{}' is in exclusive use",
                spec.queue
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            tag: spec.consumer_tag.clone(),
            connection_id: self.id,
            no_ack: spec.no_ack,
            exclusive: spec.exclusive,
            sender: tx,
        });
        state.dispatch(&spec.queue, &self.broker);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, TransportError> {
        self.ensure_open()?;
        let state = self.broker.state();
        let Some(q) = state.queues.get(queue) else {
            return Err(TransportError::NotFound(format!("queue '{queue}'")));
        };
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: u32::try_from(q.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(q.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && self.shared.channel_open.load(Ordering::SeqCst)
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        if !self.shared.channel_open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let mut state = self.broker.state();
        for queue in state.release(self.id) {
            state.dispatch(&queue, &self.broker);
        }
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), TransportError> {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared.channel_open.store(false, Ordering::SeqCst);
        let mut state = self.broker.state();
        state.connections.remove(&self.id);
        for queue in state.release(self.id) {
            state.dispatch(&queue, &self.broker);
        }
        Ok(())
    }
}
