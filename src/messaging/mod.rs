//! Asynchronous messaging over a topic broker.
//!
//! - `connection`: one broker connection/channel per process, topology setup
//! - `publisher`: envelope stamping and persistent publish
//! - `consumer`: handler registration with ack/reject semantics
//! - `events`: typed domain events on fixed exchange/routing-key pairs
//! - `transport`: the broker client seam, with `amqp` (RabbitMQ via lapin)
//!   and `memory` (in-process) implementations
//!
//! `MessageService` bundles the pieces for the rest of the application.

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod events;
pub mod memory;
pub mod publisher;
pub mod service;
pub mod topology;
pub mod transport;

pub use connection::ConnectionManager;
pub use consumer::{
    ConsumeOptions, ConsumerHandle, ConsumerRegistry, ConsumerStats, DeliveryOutcome,
    MessageHandler,
};
pub use envelope::{Envelope, RawMessage};
pub use events::{DomainEvent, EmailMessage, EventPublisher, Order, OrderStatus, Payment};
pub use memory::MemoryBroker;
pub use publisher::{PublishOptions, Publisher};
pub use service::MessageService;
pub use transport::{Connector, Flow, QueueInfo, Transport};

#[cfg(test)]
mod tests;
