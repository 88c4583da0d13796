//! Fixed broker topology
//!
//! The exchange, queue and binding names below are a wire-level contract:
//! consumers elsewhere depend on them and they must not change without a
//! migration. Declaration order is exchanges, then queues, then bindings.

pub const ORDERS_EXCHANGE: &str = "shopfinity.orders";
pub const NOTIFICATIONS_EXCHANGE: &str = "shopfinity.notifications";
pub const INVENTORY_EXCHANGE: &str = "shopfinity.inventory";
pub const PAYMENTS_EXCHANGE: &str = "shopfinity.payments";

pub const ORDER_CREATED_QUEUE: &str = "order.created";
pub const ORDER_UPDATED_QUEUE: &str = "order.updated";
pub const ORDER_CANCELLED_QUEUE: &str = "order.cancelled";
pub const PAYMENT_PROCESSED_QUEUE: &str = "payment.processed";
pub const PAYMENT_FAILED_QUEUE: &str = "payment.failed";
pub const INVENTORY_UPDATED_QUEUE: &str = "inventory.updated";
pub const EMAIL_QUEUE: &str = "email.notifications";
pub const SMS_QUEUE: &str = "sms.notifications";
pub const PUSH_QUEUE: &str = "push.notifications";

/// 24 hours.
pub const MESSAGE_TTL_MS: u32 = 86_400_000;
/// Declared as a queue argument only; enforcement is left to the broker.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: &'static str,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: &'static str,
    pub durable: bool,
    pub message_ttl_ms: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: &'static str,
    pub exchange: &'static str,
    pub pattern: &'static str,
}

/// The complete set of entities declared on every `connect()`.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    pub fn shopfinity() -> Self {
        let exchanges = [
            ORDERS_EXCHANGE,
            NOTIFICATIONS_EXCHANGE,
            INVENTORY_EXCHANGE,
            PAYMENTS_EXCHANGE,
        ]
        .into_iter()
        .map(|name| ExchangeSpec {
            name,
            kind: ExchangeKind::Topic,
            durable: true,
        })
        .collect();

        let queues = [
            ORDER_CREATED_QUEUE,
            ORDER_UPDATED_QUEUE,
            ORDER_CANCELLED_QUEUE,
            PAYMENT_PROCESSED_QUEUE,
            PAYMENT_FAILED_QUEUE,
            INVENTORY_UPDATED_QUEUE,
            EMAIL_QUEUE,
            SMS_QUEUE,
            PUSH_QUEUE,
        ]
        .into_iter()
        .map(|name| QueueSpec {
            name,
            durable: true,
            message_ttl_ms: MESSAGE_TTL_MS,
            max_retries: MAX_RETRIES,
        })
        .collect();

        let bind = |queue, exchange, pattern| Binding {
            queue,
            exchange,
            pattern,
        };
        let bindings = vec![
            bind(ORDER_CREATED_QUEUE, ORDERS_EXCHANGE, "order.created"),
            bind(ORDER_UPDATED_QUEUE, ORDERS_EXCHANGE, "order.updated"),
            bind(ORDER_CANCELLED_QUEUE, ORDERS_EXCHANGE, "order.cancelled"),
            bind(PAYMENT_PROCESSED_QUEUE, PAYMENTS_EXCHANGE, "payment.processed"),
            bind(PAYMENT_FAILED_QUEUE, PAYMENTS_EXCHANGE, "payment.failed"),
            bind(INVENTORY_UPDATED_QUEUE, INVENTORY_EXCHANGE, "inventory.updated"),
            bind(EMAIL_QUEUE, NOTIFICATIONS_EXCHANGE, "email.*"),
            bind(SMS_QUEUE, NOTIFICATIONS_EXCHANGE, "sms.*"),
            bind(PUSH_QUEUE, NOTIFICATIONS_EXCHANGE, "push.*"),
        ];

        Self {
            exchanges,
            queues,
            bindings,
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::shopfinity()
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
