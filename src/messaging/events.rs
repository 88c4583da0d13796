//! Domain Event Helpers
//!
//! Fixed business events and the exchange/routing key each one travels on.
//! The `type` field of the JSON payload is the discriminator consumers switch
//! on; decode a delivered envelope with `envelope.decode::<DomainEvent>()`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::publisher::{PublishOptions, Publisher};
use crate::messaging::topology::{
    INVENTORY_EXCHANGE, NOTIFICATIONS_EXCHANGE, ORDERS_EXCHANGE, PAYMENTS_EXCHANGE,
};
use crate::messaging::transport::Flow;
use crate::utils::error::MessagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

/// The slice of an order the order events carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub total: f64,
    /// Line items exactly as the caller shaped them.
    pub items: Vec<Value>,
    pub status: OrderStatus,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub order_id: String,
    pub amount: f64,
    pub payment_method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub template: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    OrderCreated {
        order_id: String,
        user_id: String,
        total: f64,
        items: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    OrderUpdated {
        order_id: String,
        status: OrderStatus,
        updated_at: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderCancelled {
        order_id: String,
        reason: String,
        cancelled_at: String,
    },
    #[serde(rename_all = "camelCase")]
    PaymentProcessed {
        order_id: String,
        amount: f64,
        payment_method: String,
    },
    #[serde(rename_all = "camelCase")]
    PaymentFailed {
        order_id: String,
        amount: f64,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    InventoryUpdated {
        product_id: String,
        new_stock: i64,
        updated_at: String,
    },
    EmailNotification {
        to: String,
        subject: String,
        template: String,
        data: Value,
    },
    SmsNotification {
        to: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    PushNotification {
        user_id: String,
        title: String,
        body: String,
    },
}

impl DomainEvent {
    /// (exchange, routing key)
    pub fn route(&self) -> (&'static str, &'static str) {
        match self {
            DomainEvent::OrderCreated { .. } => (ORDERS_EXCHANGE, "order.created"),
            DomainEvent::OrderUpdated { .. } => (ORDERS_EXCHANGE, "order.updated"),
            DomainEvent::OrderCancelled { .. } => (ORDERS_EXCHANGE, "order.cancelled"),
            DomainEvent::PaymentProcessed { .. } => (PAYMENTS_EXCHANGE, "payment.processed"),
            DomainEvent::PaymentFailed { .. } => (PAYMENTS_EXCHANGE, "payment.failed"),
            DomainEvent::InventoryUpdated { .. } => (INVENTORY_EXCHANGE, "inventory.updated"),
            DomainEvent::EmailNotification { .. } => (NOTIFICATIONS_EXCHANGE, "email.send"),
            DomainEvent::SmsNotification { .. } => (NOTIFICATIONS_EXCHANGE, "sms.send"),
            DomainEvent::PushNotification { .. } => (NOTIFICATIONS_EXCHANGE, "push.send"),
        }
    }

    /// The value of the `type` field on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "ORDER_CREATED",
            DomainEvent::OrderUpdated { .. } => "ORDER_UPDATED",
            DomainEvent::OrderCancelled { .. } => "ORDER_CANCELLED",
            DomainEvent::PaymentProcessed { .. } => "PAYMENT_PROCESSED",
            DomainEvent::PaymentFailed { .. } => "PAYMENT_FAILED",
            DomainEvent::InventoryUpdated { .. } => "INVENTORY_UPDATED",
            DomainEvent::EmailNotification { .. } => "EMAIL_NOTIFICATION",
            DomainEvent::SmsNotification { .. } => "SMS_NOTIFICATION",
            DomainEvent::PushNotification { .. } => "PUSH_NOTIFICATION",
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Thin typed wrappers over [`Publisher::publish`].
#[derive(Debug, Clone)]
pub struct EventPublisher {
    publisher: Publisher,
}

impl EventPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    pub async fn publish_event(&self, event: &DomainEvent) -> Result<Flow, MessagingError> {
        let (exchange, routing_key) = event.route();
        self.publisher
            .publish(exchange, routing_key, event, PublishOptions::default())
            .await
    }

    pub async fn publish_order_created(&self, order: &Order) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::OrderCreated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            total: order.total,
            items: order.items.clone(),
        })
        .await
    }

    pub async fn publish_order_updated(&self, order: &Order) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::OrderUpdated {
            order_id: order.id.clone(),
            status: order.status,
            updated_at: order.updated_at.clone(),
        })
        .await
    }

    pub async fn publish_order_cancelled(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::OrderCancelled {
            order_id: order_id.to_string(),
            reason: reason.to_string(),
            cancelled_at: now_iso(),
        })
        .await
    }

    pub async fn publish_payment_processed(
        &self,
        payment: &Payment,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::PaymentProcessed {
            order_id: payment.order_id.clone(),
            amount: payment.amount,
            payment_method: payment.payment_method.clone(),
        })
        .await
    }

    pub async fn publish_payment_failed(
        &self,
        payment: &Payment,
        reason: &str,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::PaymentFailed {
            order_id: payment.order_id.clone(),
            amount: payment.amount,
            reason: reason.to_string(),
        })
        .await
    }

    /// `updatedAt` is stamped with the current time.
    pub async fn publish_inventory_update(
        &self,
        product_id: &str,
        new_stock: i64,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::InventoryUpdated {
            product_id: product_id.to_string(),
            new_stock,
            updated_at: now_iso(),
        })
        .await
    }

    pub async fn publish_email_notification(
        &self,
        email: &EmailMessage,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::EmailNotification {
            to: email.to.clone(),
            subject: email.subject.clone(),
            template: email.template.clone(),
            data: email.data.clone(),
        })
        .await
    }

    pub async fn publish_sms_notification(
        &self,
        to: &str,
        message: &str,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::SmsNotification {
            to: to.to_string(),
            message: message.to_string(),
        })
        .await
    }

    pub async fn publish_push_notification(
        &self,
        user_id: &str,
        title: &str,
        body: &str,
    ) -> Result<Flow, MessagingError> {
        self.publish_event(&DomainEvent::PushNotification {
            user_id: user_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        })
        .await
    }
}
