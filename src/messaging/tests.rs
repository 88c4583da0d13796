use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use super::consumer::process_delivery;
use super::envelope::{generate_message_id, is_valid_message_id};
use super::publisher::to_object;
use super::topology::*;
use super::transport::{Acknowledger, InboundDelivery};
use super::*;
use crate::config::Settings;
use crate::messaging::connection::ConnectionManager;
use crate::utils::error::{MessagingError, TransportError};
use crate::utils::retry::RetryPolicy;

fn service(broker: &MemoryBroker) -> MessageService {
    MessageService::new(Arc::new(broker.clone()), Settings::default().rabbitmq)
}

async fn connected(broker: &MemoryBroker) -> MessageService {
    let svc = service(broker);
    svc.connect().await.expect("connect to memory broker");
    svc
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn body_json(message: &memory::BrokerMessage) -> Value {
    serde_json::from_slice(&message.body).expect("json body")
}

#[test]
fn topic_patterns_follow_amqp_rules() {
    assert!(topic_matches("order.created", "order.created"));
    assert!(!topic_matches("order.created", "order.updated"));
    assert!(topic_matches("email.*", "email.send"));
    assert!(!topic_matches("email.*", "email"));
    assert!(!topic_matches("email.*", "email.send.now"));
    assert!(topic_matches("email.#", "email"));
    assert!(topic_matches("email.#", "email.send.now"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(topic_matches("*.created", "order.created"));
}

#[test]
fn message_ids_have_expected_shape() {
    let id = generate_message_id();
    assert!(is_valid_message_id(&id), "{id}");
    assert_ne!(id, generate_message_id());

    assert!(!is_valid_message_id("msg_123"));
    assert!(!is_valid_message_id("msg_abc_123456789"));
    assert!(!is_valid_message_id("id_1700000000000_abcdefghi"));
    assert!(!is_valid_message_id("msg_1700000000000_ABCDEFGHI"));
}

#[test]
fn envelope_metadata_overrides_payload_fields() {
    let payload = to_object(&json!({
        "orderId": "o1",
        "timestamp": "yesterday",
        "messageId": "spoofed"
    }))
    .unwrap();
    let envelope = Envelope::wrap(payload);

    assert_ne!(envelope.timestamp, "yesterday");
    assert!(is_valid_message_id(&envelope.message_id));

    let wire: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
    assert_eq!(wire["orderId"], "o1");
    assert_eq!(wire["messageId"], envelope.message_id.as_str());
    assert!(chrono::DateTime::parse_from_rfc3339(wire["timestamp"].as_str().unwrap()).is_ok());
}

#[test]
fn envelope_requires_metadata() {
    assert!(Envelope::from_slice(br#"{"orderId":"o1"}"#).is_err());
    assert!(Envelope::from_slice(b"not json").is_err());
    assert!(
        Envelope::from_slice(br#"{"a":1,"timestamp":"t","messageId":"m"}"#)
            .map(|e| e.get("a") == Some(&json!(1)))
            .unwrap()
    );
}

#[test]
fn non_object_payloads_are_rejected() {
    assert!(matches!(
        to_object(&"text"),
        Err(MessagingError::InvalidPayload("a string"))
    ));
    assert!(matches!(
        to_object(&vec![1, 2]),
        Err(MessagingError::InvalidPayload("an array"))
    ));
    assert!(to_object(&json!({ "ok": true })).is_ok());
}

#[test]
fn domain_events_serialize_with_type_tag() {
    let event = DomainEvent::InventoryUpdated {
        product_id: "p7".into(),
        new_stock: 3,
        updated_at: "2024-01-01T00:00:00.000Z".into(),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "INVENTORY_UPDATED");
    assert_eq!(value["productId"], "p7");
    assert_eq!(value["newStock"], 3);
    assert_eq!(event.route(), (INVENTORY_EXCHANGE, "inventory.updated"));
    assert_eq!(event.event_type(), "INVENTORY_UPDATED");

    let email = DomainEvent::EmailNotification {
        to: "a@b.c".into(),
        subject: "Hi".into(),
        template: "welcome".into(),
        data: json!({}),
    };
    assert_eq!(serde_json::to_value(&email).unwrap()["type"], "EMAIL_NOTIFICATION");
}

#[tokio::test]
async fn publish_while_disconnected_fails_without_side_effects() {
    let broker = MemoryBroker::new();
    let svc = service(&broker);

    let result = svc
        .publish(ORDERS_EXCHANGE, "order.created", &json!({ "x": 1 }), PublishOptions::default())
        .await;
    assert!(matches!(result, Err(MessagingError::NotConnected)));
    assert_eq!(broker.connection_count(), 0);
    assert!(!broker.has_exchange(ORDERS_EXCHANGE));

    let consume = svc
        .consume(
            ORDER_CREATED_QUEUE,
            |_e: Envelope, _r: RawMessage| async { Ok(()) },
            ConsumeOptions::default(),
        )
        .await;
    assert!(matches!(consume, Err(MessagingError::NotConnected)));
}

#[tokio::test]
async fn connect_declares_full_topology() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    assert!(svc.is_connected());

    for exchange in [ORDERS_EXCHANGE, NOTIFICATIONS_EXCHANGE, INVENTORY_EXCHANGE, PAYMENTS_EXCHANGE] {
        assert!(broker.has_exchange(exchange), "{exchange}");
    }
    let spec = broker.queue_spec(PAYMENT_FAILED_QUEUE).unwrap();
    assert!(spec.durable);
    assert_eq!(spec.message_ttl_ms, 86_400_000);
    assert_eq!(spec.max_retries, 3);

    assert_eq!(
        broker.bindings(EMAIL_QUEUE),
        vec![(NOTIFICATIONS_EXCHANGE.to_string(), "email.*".to_string())]
    );
    assert_eq!(
        broker.bindings(ORDER_CREATED_QUEUE),
        vec![(ORDERS_EXCHANGE.to_string(), "order.created".to_string())]
    );
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    svc.connect().await.unwrap();

    assert!(svc.is_connected());
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(broker.bindings(SMS_QUEUE).len(), 1);
}

#[tokio::test]
async fn conflicting_declaration_fails_connect_and_closes_transport() {
    let broker = MemoryBroker::new();
    let squatter = broker.connect("amqp://other").await.unwrap();
    squatter
        .declare_queue(&QueueSpec {
            name: ORDER_CREATED_QUEUE,
            durable: true,
            message_ttl_ms: 1_000,
            max_retries: 3,
        })
        .await
        .unwrap();

    let svc = service(&broker);
    let err = svc.connect().await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Topology {
            source: TransportError::PreconditionFailed(_),
            ..
        }
    ));
    assert!(!svc.is_connected());
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn startup_retry_outlasts_refused_connections() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(2);
    let svc = service(&broker);

    assert!(svc.connect_with_retry(RetryPolicy::new(3, Duration::from_millis(1))).await);
    assert!(svc.is_connected());
}

#[tokio::test]
async fn startup_retry_gives_up_and_stays_degraded() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(10);
    let svc = service(&broker);

    assert!(!svc.connect_with_retry(RetryPolicy::new(2, Duration::from_millis(1))).await);
    assert!(!svc.is_connected());
    assert!(svc.queue_info(EMAIL_QUEUE).await.is_none());
}

#[tokio::test]
async fn broker_drop_clears_connected_flag() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    broker.drop_connections("CONNECTION_FORCED");
    assert!(!svc.is_connected());
    assert!(matches!(
        svc.send_to_queue(EMAIL_QUEUE, &json!({ "a": 1 }), PublishOptions::default())
            .await,
        Err(MessagingError::NotConnected)
    ));

    svc.connect().await.unwrap();
    assert!(svc.is_connected());
}

#[tokio::test]
async fn published_messages_are_persistent_and_stamped() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    let flow = svc
        .publish(
            ORDERS_EXCHANGE,
            "order.created",
            &json!({ "orderId": "o1" }),
            PublishOptions::default().with_correlation_id("req-1"),
        )
        .await
        .unwrap();
    assert_eq!(flow, Flow::Accepted);

    let ready = broker.ready_messages(ORDER_CREATED_QUEUE);
    assert_eq!(ready.len(), 1);
    let message = &ready[0];
    assert!(message.properties.persistent);
    assert_eq!(message.properties.content_type, "application/json");
    assert_eq!(message.properties.correlation_id.as_deref(), Some("req-1"));
    assert!(is_valid_message_id(&message.properties.message_id));

    let body = body_json(message);
    assert_eq!(body["orderId"], "o1");
    assert_eq!(body["messageId"], message.properties.message_id.as_str());
    assert_eq!(broker.queue_depth(ORDER_UPDATED_QUEUE), 0);
}

#[tokio::test]
async fn send_to_queue_bypasses_exchanges() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    svc.send_to_queue(PUSH_QUEUE, &json!({ "userId": "u1" }), PublishOptions::default().transient())
        .await
        .unwrap();

    let ready = broker.ready_messages(PUSH_QUEUE);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].exchange, "");
    assert!(!ready[0].properties.persistent);
}

#[tokio::test]
async fn throttled_broker_reports_flow_signal() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    broker.set_throttled(true);

    let flow = svc
        .events()
        .publish_sms_notification("+15550100", "Your order shipped")
        .await
        .unwrap();
    assert_eq!(flow, Flow::Throttled);
    assert_eq!(broker.queue_depth(SMS_QUEUE), 1);
}

#[tokio::test]
async fn queue_info_reports_depth_and_consumers() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    svc.events()
        .publish_order_cancelled("o9", "customer request")
        .await
        .unwrap();

    let info = svc.queue_info(ORDER_CANCELLED_QUEUE).await.unwrap();
    assert_eq!(info.name, ORDER_CANCELLED_QUEUE);
    assert_eq!(info.message_count, 1);
    assert_eq!(info.consumer_count, 0);
    assert!(svc.queue_info("no.such.queue").await.is_none());
}

#[tokio::test]
async fn inventory_update_round_trip() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = svc
        .consume(
            INVENTORY_UPDATED_QUEUE,
            move |envelope: Envelope, raw: RawMessage| {
                let tx = tx.clone();
                async move {
                    tx.send((envelope, raw))
                        .map_err(|_| anyhow::anyhow!("test receiver dropped"))
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    svc.events().publish_inventory_update("p7", 3).await.unwrap();

    let (envelope, raw) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.routing_key, "inventory.updated");
    assert_eq!(raw.exchange, INVENTORY_EXCHANGE);
    assert_eq!(envelope.event_type(), Some("INVENTORY_UPDATED"));
    match envelope.decode::<DomainEvent>().unwrap() {
        DomainEvent::InventoryUpdated {
            product_id,
            new_stock,
            updated_at,
        } => {
            assert_eq!(product_id, "p7");
            assert_eq!(new_stock, 3);
            assert!(chrono::DateTime::parse_from_rfc3339(&updated_at).is_ok());
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stats = handle.stats();
    wait_until(|| stats.acked() == 1).await;
    assert_eq!(broker.acked_count(), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert!(handle.queue() == INVENTORY_UPDATED_QUEUE);
    assert!(handle.consumer_tag().starts_with("inventory.updated-"));
    handle.abort();
}

#[tokio::test]
async fn order_created_carries_order_fields() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let order = Order {
        id: "o1".into(),
        user_id: "u1".into(),
        total: 42.5,
        items: vec![json!({ "sku": "A", "qty": 2 })],
        status: OrderStatus::Pending,
        updated_at: "2024-01-01T00:00:00.000Z".into(),
    };
    svc.events().publish_order_created(&order).await.unwrap();
    svc.events().publish_order_updated(&order).await.unwrap();

    let created = body_json(&broker.ready_messages(ORDER_CREATED_QUEUE)[0]);
    assert_eq!(created["type"], "ORDER_CREATED");
    assert_eq!(created["orderId"], "o1");
    assert_eq!(created["userId"], "u1");
    assert_eq!(created["total"], 42.5);
    assert_eq!(created["items"][0]["sku"], "A");

    let updated = body_json(&broker.ready_messages(ORDER_UPDATED_QUEUE)[0]);
    assert_eq!(updated["type"], "ORDER_UPDATED");
    assert_eq!(updated["status"], "pending");
}

#[tokio::test]
async fn payment_and_notification_events_reach_their_queues() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let payment = Payment {
        order_id: "o1".into(),
        amount: 10.0,
        payment_method: "card".into(),
    };
    let events = svc.events();
    events.publish_payment_processed(&payment).await.unwrap();
    events.publish_payment_failed(&payment, "declined").await.unwrap();
    events
        .publish_email_notification(&EmailMessage {
            to: "a@b.c".into(),
            subject: "Receipt".into(),
            template: "receipt".into(),
            data: json!({ "orderId": "o1" }),
        })
        .await
        .unwrap();
    events.publish_push_notification("u1", "Shipped", "On its way").await.unwrap();

    assert_eq!(broker.queue_depth(PAYMENT_PROCESSED_QUEUE), 1);
    let failed = body_json(&broker.ready_messages(PAYMENT_FAILED_QUEUE)[0]);
    assert_eq!(failed["reason"], "declined");
    let email = body_json(&broker.ready_messages(EMAIL_QUEUE)[0]);
    assert_eq!(email["template"], "receipt");
    assert_eq!(email["data"]["orderId"], "o1");
    let push = body_json(&broker.ready_messages(PUSH_QUEUE)[0]);
    assert_eq!(push["userId"], "u1");
}

#[tokio::test]
async fn failing_handler_rejects_and_keeps_consuming() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let handle = svc
        .consume(
            ORDER_CREATED_QUEUE,
            move |envelope: Envelope, _raw: RawMessage| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if envelope.get("fail") == Some(&json!(true)) {
                        anyhow::bail!("order rejected by handler");
                    }
                    Ok(())
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    for fail in [true, false] {
        svc.publish(ORDERS_EXCHANGE, "order.created", &json!({ "fail": fail }), PublishOptions::default())
            .await
            .unwrap();
    }

    let stats = handle.stats();
    wait_until(|| stats.processed() == 2).await;
    assert_eq!(stats.rejected(), 1);
    assert_eq!(stats.acked(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].queue, ORDER_CREATED_QUEUE);
    assert_eq!(body_json(&dead[0].message)["fail"], true);
    assert_eq!(broker.queue_depth(ORDER_CREATED_QUEUE), 0);
    handle.abort();
}

#[tokio::test]
async fn panicking_handler_is_treated_as_rejection() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    let handle = svc
        .consume(
            EMAIL_QUEUE,
            |envelope: Envelope, _raw: RawMessage| async move {
                if envelope.get("boom").is_some() {
                    panic!("handler blew up");
                }
                Ok(())
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    svc.send_to_queue(EMAIL_QUEUE, &json!({ "boom": 1 }), PublishOptions::default())
        .await
        .unwrap();
    svc.send_to_queue(EMAIL_QUEUE, &json!({ "fine": 1 }), PublishOptions::default())
        .await
        .unwrap();

    let stats = handle.stats();
    wait_until(|| stats.processed() == 2).await;
    assert_eq!(stats.rejected(), 1);
    assert_eq!(broker.dead_letters().len(), 1);
    assert!(!handle.is_finished());
    handle.abort();
}

#[tokio::test]
async fn malformed_body_is_rejected_without_calling_handler() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let raw_channel = broker.connect("amqp://raw").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let handle = svc
        .consume(
            SMS_QUEUE,
            move |_e: Envelope, _r: RawMessage| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    let props = transport::MessageProperties {
        persistent: true,
        content_type: "application/json".into(),
        message_id: "x".into(),
        timestamp: 0,
        priority: None,
        expiration: None,
        correlation_id: None,
        headers: Default::default(),
    };
    raw_channel
        .publish("", SMS_QUEUE, b"{not json".to_vec(), props)
        .await
        .unwrap();

    let stats = handle.stats();
    wait_until(|| stats.rejected() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.dead_letters().len(), 1);
    handle.abort();
}

#[tokio::test]
async fn unacked_messages_are_redelivered_after_drop() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let started = Arc::new(Notify::new());
    let gate = started.clone();

    let handle = svc
        .consume(
            ORDER_UPDATED_QUEUE,
            move |_e: Envelope, _r: RawMessage| {
                let gate = gate.clone();
                async move {
                    gate.notify_one();
                    std::future::pending::<()>().await;
                    Ok(())
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    svc.publish(ORDERS_EXCHANGE, "order.updated", &json!({ "orderId": "o2" }), PublishOptions::default())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), started.notified())
        .await
        .unwrap();
    assert_eq!(broker.unacked_count(), 1);

    broker.drop_connections("heartbeat timeout");

    let ready = broker.ready_messages(ORDER_UPDATED_QUEUE);
    assert_eq!(ready.len(), 1);
    assert!(ready[0].redelivered);
    assert_eq!(broker.consumer_count(ORDER_UPDATED_QUEUE), 0);
    handle.abort();
}

#[tokio::test]
async fn consumers_end_on_disconnect() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let handle = svc
        .consume(
            PAYMENT_PROCESSED_QUEUE,
            |_e: Envelope, _r: RawMessage| async { Ok(()) },
            ConsumeOptions {
                consumer_tag: Some("billing".into()),
                ..ConsumeOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.consumer_tag(), "billing");
    assert_eq!(broker.consumer_count(PAYMENT_PROCESSED_QUEUE), 1);
    assert_eq!(svc.consumers().registrations().len(), 1);

    svc.disconnect().await;
    assert!(!svc.is_connected());
    assert_eq!(broker.connection_count(), 0);
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .unwrap();
    assert!(svc.consumers().registrations().is_empty());

    assert!(matches!(
        svc.events().publish_inventory_update("p1", 1).await,
        Err(MessagingError::NotConnected)
    ));
}

#[tokio::test]
async fn exclusive_consumer_blocks_others() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let exclusive = ConsumeOptions {
        exclusive: true,
        ..ConsumeOptions::default()
    };
    let first = svc
        .consume(SMS_QUEUE, |_e: Envelope, _r: RawMessage| async { Ok(()) }, exclusive)
        .await
        .unwrap();

    let second = svc
        .consume(
            SMS_QUEUE,
            |_e: Envelope, _r: RawMessage| async { Ok(()) },
            ConsumeOptions::default(),
        )
        .await;
    assert!(matches!(
        second,
        Err(MessagingError::Consume {
            source: TransportError::PreconditionFailed(_),
            ..
        })
    ));
    first.abort();
}

#[tokio::test]
async fn aborted_consumers_leave_registrations() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;
    let noop = |_e: Envelope, _r: RawMessage| async { Ok(()) };

    let orders = svc
        .consume(ORDER_CREATED_QUEUE, noop, ConsumeOptions::default())
        .await
        .unwrap();
    let emails = svc
        .consume(EMAIL_QUEUE, noop, ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(svc.consumers().registrations().len(), 2);

    orders.abort();
    wait_until(|| orders.is_finished()).await;

    let live = svc.consumers().registrations();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].queue, EMAIL_QUEUE);
    assert_eq!(live[0].consumer_tag, emails.consumer_tag());
    emails.abort();
}

struct RecordingAcker {
    settled: mpsc::UnboundedSender<&'static str>,
}

#[async_trait::async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        let _ = self.settled.send("ack");
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        let _ = self
            .settled
            .send(if requeue { "requeue" } else { "reject" });
        Ok(())
    }
}

fn delivery(data: &[u8], settled: &mpsc::UnboundedSender<&'static str>) -> InboundDelivery {
    InboundDelivery {
        raw: RawMessage {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "q".into(),
            redelivered: false,
            data: data.to_vec(),
        },
        acker: Box::new(RecordingAcker {
            settled: settled.clone(),
        }),
    }
}

#[tokio::test]
async fn no_ack_deliveries_are_never_settled() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stats = ConsumerStats::default();
    let ok = |_e: Envelope, _r: RawMessage| async { Ok(()) };
    let body = br#"{"timestamp":"t","messageId":"m"}"#;

    let outcome = process_delivery("q", true, delivery(body, &tx), &ok, &stats).await;
    assert_eq!(outcome, DeliveryOutcome::Acked);
    assert!(rx.try_recv().is_err());

    let outcome = process_delivery("q", false, delivery(body, &tx), &ok, &stats).await;
    assert_eq!(outcome, DeliveryOutcome::Acked);
    assert_eq!(rx.try_recv().unwrap(), "ack");

    let outcome = process_delivery("q", false, delivery(b"[]", &tx), &ok, &stats).await;
    assert_eq!(outcome, DeliveryOutcome::Rejected);
    assert_eq!(rx.try_recv().unwrap(), "reject");
    assert_eq!(stats.processed(), 3);
}

#[tokio::test]
async fn one_queue_is_handled_serially_in_publish_order() {
    let broker = MemoryBroker::new();
    let svc = connected(&broker).await;

    let blocked = svc
        .consume(
            EMAIL_QUEUE,
            |_e: Envelope, _r: RawMessage| async {
                std::future::pending::<()>().await;
                Ok(())
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    svc.send_to_queue(EMAIL_QUEUE, &json!({ "to": "a@b.c" }), PublishOptions::default())
        .await
        .unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let (in_flight, overlapped, seen) = (in_flight.clone(), overlapped.clone(), seen.clone());
        svc.consume(
            ORDER_CREATED_QUEUE,
            move |envelope: Envelope, _raw: RawMessage| {
                let (in_flight, overlapped, seen) =
                    (in_flight.clone(), overlapped.clone(), seen.clone());
                async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    let seq = envelope.get("seq").and_then(Value::as_u64);
                    seen.lock().unwrap().push(seq);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap()
    };

    for seq in 0..20u64 {
        svc.publish(ORDERS_EXCHANGE, "order.created", &json!({ "seq": seq }), PublishOptions::default())
            .await
            .unwrap();
    }

    let stats = handle.stats();
    wait_until(|| stats.acked() == 20).await;
    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(
        *seen.lock().unwrap(),
        (0..20u64).map(Some).collect::<Vec<_>>()
    );
    assert_eq!(blocked.stats().processed(), 0);
    assert_eq!(broker.unacked_count(), 1);

    broker.drop_connections("maintenance");
    svc.disconnect().await;
    assert!(!svc.is_connected());
    blocked.abort();
    handle.abort();
}

/// Connector that parks inside `connect` until released.
struct GatedConnector {
    broker: MemoryBroker,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.broker.connect(uri).await
    }
}

#[tokio::test]
async fn disconnect_during_connect_wins() {
    let broker = MemoryBroker::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(GatedConnector {
            broker: broker.clone(),
            entered: entered.clone(),
            release: release.clone(),
        }),
        Settings::default().rabbitmq,
    ));

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    tokio::time::timeout(Duration::from_secs(1), entered.notified())
        .await
        .unwrap();

    manager.disconnect().await;
    release.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(MessagingError::NotConnected)));
    assert!(!manager.is_connected());
    assert_eq!(broker.connection_count(), 0);

    release.notify_one();
    manager.connect().await.unwrap();
    assert!(manager.is_connected());
}
