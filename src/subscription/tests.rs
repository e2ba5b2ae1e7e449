use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use super::{Settlement, SubscriptionState};
use crate::broker::MemoryBroker;
use crate::client::{BrokerEndpoint, Connection, Message};
use crate::topology::QueueSpec;
use crate::transport::{Channel, OutboundMessage, Transport};
use crate::utils::MqError;

const WAIT: Duration = Duration::from_secs(2);
const SHORT: Duration = Duration::from_millis(50);

fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("guest", "guest", "localhost", 5672, "/")
}

async fn connected(broker: &MemoryBroker, queue: &str) -> Connection {
    let mut conn = Connection::new(endpoint(), Arc::new(broker.clone()));
    conn.connect().await.unwrap();
    conn.declare(&QueueSpec::new(queue)).await.unwrap();
    conn
}

async fn publish(conn: &Connection, queue: &str, count: usize) {
    for i in 0..count {
        conn.send(&Message::new(format!("m{i}"), json!({ "n": i })), queue, "")
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_publish_consume_ack_scenario() {
    let broker = MemoryBroker::new();
    let mut conn = Connection::new(endpoint(), Arc::new(broker.clone()));
    conn.connect().await.unwrap();
    conn.declare(&QueueSpec::new("q1").exchange("ex1").ttl_seconds(60))
        .await
        .unwrap();

    conn.send(&Message::new("m1", json!({"x": 1})), "q1", "ex1")
        .await
        .unwrap();

    let mut sub = conn.open("q1", 1).await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Created);

    let mut first = sub.next_timeout(WAIT).await.unwrap().expect("first delivery");
    assert_eq!(sub.state(), SubscriptionState::Consuming);
    assert_eq!(first.id(), Some("m1"));
    assert_eq!(first.body(), &json!({"x": 1}));
    assert!(!first.redelivered());

    conn.send(&Message::new("m2", json!({"x": 2})), "q1", "ex1")
        .await
        .unwrap();
    // the single prefetch slot is taken
    assert!(sub.next_timeout(SHORT).await.unwrap().is_none());

    first.ack().await.unwrap();
    assert_eq!(first.settlement(), Some(Settlement::Acknowledged));

    let mut second = sub.next_timeout(WAIT).await.unwrap().expect("second delivery");
    assert_eq!(second.id(), Some("m2"));
    second.ack().await.unwrap();

    sub.close().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn test_second_settlement_is_rejected() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "jobs").await;
    publish(&conn, "jobs", 2).await;
    let mut sub = conn.open("jobs", 2).await.unwrap();

    let mut acked = sub.next_timeout(WAIT).await.unwrap().unwrap();
    acked.ack().await.unwrap();
    let err = acked.ack().await.unwrap_err();
    assert!(matches!(
        err,
        MqError::InvalidAcknowledgmentState {
            settled: "acknowledged",
            ..
        }
    ));
    assert!(matches!(
        acked.reject().await,
        Err(MqError::InvalidAcknowledgmentState { .. })
    ));

    let mut rejected = sub.next_timeout(WAIT).await.unwrap().unwrap();
    rejected.reject().await.unwrap();
    assert!(matches!(
        rejected.reject().await,
        Err(MqError::InvalidAcknowledgmentState { .. })
    ));
    assert!(matches!(
        rejected.ack().await,
        Err(MqError::InvalidAcknowledgmentState { .. })
    ));
    assert_eq!(sub.unacked(), 0);
    assert_eq!(broker.unacked("jobs"), 0);
}

#[tokio::test]
async fn test_prefetch_bounds_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "bounded").await;
    publish(&conn, "bounded", 5).await;

    let mut sub = conn.open("bounded", 2).await.unwrap();
    let mut a = sub.next_timeout(WAIT).await.unwrap().unwrap();
    let _b = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert!(sub.next_timeout(SHORT).await.unwrap().is_none());
    assert_eq!(sub.unacked(), 2);
    assert_eq!(broker.unacked("bounded"), 2);
    assert_eq!(broker.queue_depth("bounded"), Some(3));

    a.ack().await.unwrap();
    let c = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(c.id(), Some("m2"));
    assert_eq!(broker.peak_unacked("bounded"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prefetch_holds_under_concurrent_publishing() {
    const TOTAL: usize = 40;
    const PREFETCH: u16 = 3;

    let broker = MemoryBroker::new();
    let consumer_conn = connected(&broker, "busy").await;
    let mut sub = consumer_conn.open("busy", PREFETCH).await.unwrap();

    let mut publishers = Vec::new();
    for p in 0..4 {
        let broker = broker.clone();
        publishers.push(tokio::spawn(async move {
            let mut conn = Connection::new(endpoint(), Arc::new(broker));
            conn.connect().await.unwrap();
            for i in 0..TOTAL / 4 {
                conn.send(&Message::new(format!("p{p}-{i}"), json!(i)), "busy", "")
                    .await
                    .unwrap();
            }
            conn.close().await;
        }));
    }

    let consumer = tokio::spawn(async move {
        let mut received = 0;
        while received < TOTAL {
            let mut delivery = sub.next_timeout(WAIT).await.unwrap().expect("delivery");
            assert!(sub.unacked() <= usize::from(PREFETCH));
            tokio::time::sleep(Duration::from_millis(1)).await;
            delivery.ack().await.unwrap();
            received += 1;
        }
        received
    });

    for publisher in publishers {
        publisher.await.unwrap();
    }
    assert_eq!(consumer.await.unwrap(), TOTAL);
    assert!(broker.peak_unacked("busy") <= usize::from(PREFETCH));
    assert_eq!(broker.queue_depth("busy"), Some(0));
}

#[tokio::test]
async fn test_closing_connection_unblocks_waiting_subscription() {
    let broker = MemoryBroker::new();
    let mut conn = connected(&broker, "idle").await;
    let mut sub = conn.open("idle", 1).await.unwrap();

    let waiter = tokio::spawn(async move {
        let result = sub.next().await;
        (result, sub.state())
    });
    tokio::time::sleep(SHORT).await;
    conn.close().await;

    let (result, state) = tokio::time::timeout(WAIT, waiter)
        .await
        .expect("subscription stayed blocked")
        .unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, MqError::ConnectionClosed));
    assert!(err.is_transport());
    assert_eq!(state, SubscriptionState::Closed);
}

#[tokio::test]
async fn test_connection_loss_surfaces_as_connection_closed() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "lost").await;
    let mut sub = conn.open("lost", 1).await.unwrap();

    broker.disconnect_all();

    let err = sub.next_timeout(WAIT).await.unwrap_err();
    assert!(err.is_transport());
    // not restartable
    assert!(sub.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_handle_stops_a_blocked_next() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "cancelled").await;
    let mut sub = conn.open("cancelled", 1).await.unwrap();
    let cancel = sub.cancel_handle();
    assert_eq!(broker.consumer_count("cancelled"), 1);

    let waiter = tokio::spawn(async move {
        let next = sub.next().await;
        (next.map(|d| d.is_none()), sub.state())
    });
    tokio::time::sleep(SHORT).await;
    cancel.cancel();

    let (ended, state) = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(ended.unwrap());
    assert_eq!(state, SubscriptionState::Closed);
    assert_eq!(broker.consumer_count("cancelled"), 0);
}

#[tokio::test]
async fn test_close_returns_unsettled_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "handback").await;
    publish(&conn, "handback", 1).await;

    let mut sub = conn.open("handback", 1).await.unwrap();
    let mut pending = sub.next_timeout(WAIT).await.unwrap().unwrap();
    sub.close().await.unwrap();
    sub.close().await.unwrap();

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(sub.next().await.unwrap().is_none());
    assert_eq!(pending.settlement(), Some(Settlement::Returned));
    assert!(matches!(
        pending.ack().await,
        Err(MqError::InvalidAcknowledgmentState { .. })
    ));

    let mut again = conn.open("handback", 1).await.unwrap();
    let mut redelivered = again.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(redelivered.id(), Some("m0"));
    assert!(redelivered.redelivered());
    redelivered.ack().await.unwrap();
}

async fn drain_ids(conn: &Connection, queue: &str, prefetch: u16) -> Vec<String> {
    let mut sub = conn.open(queue, prefetch).await.unwrap();
    let mut ids = Vec::new();
    while let Some(mut delivery) = sub.next_timeout(SHORT).await.unwrap() {
        ids.push(delivery.id().unwrap().to_string());
        delivery.ack().await.unwrap();
    }
    ids.sort();
    ids
}

#[tokio::test]
async fn test_close_returns_buffered_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "buffered").await;
    publish(&conn, "buffered", 3).await;

    let mut sub = conn.open("buffered", 3).await.unwrap();
    let pulled = sub.next_timeout(WAIT).await.unwrap().unwrap();
    // the other two were pushed but never pulled
    assert_eq!(broker.unacked("buffered"), 3);

    sub.close().await.unwrap();
    assert_eq!(pulled.settlement(), Some(Settlement::Returned));
    assert_eq!(broker.unacked("buffered"), 0);
    assert_eq!(broker.queue_depth("buffered"), Some(3));
    assert_eq!(drain_ids(&conn, "buffered", 3).await, ["m0", "m1", "m2"]);
}

#[tokio::test]
async fn test_dropping_subscription_returns_buffered_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "abandoned").await;
    publish(&conn, "abandoned", 3).await;

    let mut sub = conn.open("abandoned", 3).await.unwrap();
    let pulled = sub.next_timeout(WAIT).await.unwrap().unwrap();
    drop(sub);

    tokio::time::timeout(WAIT, async {
        while broker.queue_depth("abandoned") != Some(3) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dropped subscription hands its deliveries back");
    assert_eq!(broker.consumer_count("abandoned"), 0);
    assert_eq!(broker.unacked("abandoned"), 0);
    assert_eq!(pulled.settlement(), Some(Settlement::Returned));
}

#[tokio::test]
async fn test_failed_hand_back_keeps_deliveries_unsettled() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "stuck").await;
    publish(&conn, "stuck", 2).await;

    let mut sub = conn.open("stuck", 2).await.unwrap();
    let mut a = sub.next_timeout(WAIT).await.unwrap().unwrap();
    let mut b = sub.next_timeout(WAIT).await.unwrap().unwrap();

    broker.refuse_command("basic.reject", true);
    let err = sub.close().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.unacked(), 2);
    assert_eq!(a.settlement(), None);
    assert_eq!(broker.unacked("stuck"), 2);

    broker.refuse_command("basic.reject", false);
    a.ack().await.unwrap();
    b.ack().await.unwrap();
    assert_eq!(broker.unacked("stuck"), 0);
    assert_eq!(broker.queue_depth("stuck"), Some(0));
}

#[tokio::test]
async fn test_failed_cancel_still_hands_back_pulled_deliveries() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "sticky").await;
    publish(&conn, "sticky", 1).await;

    let mut sub = conn.open("sticky", 1).await.unwrap();
    let mut pending = sub.next_timeout(WAIT).await.unwrap().unwrap();

    broker.refuse_command("basic.cancel", true);
    assert!(sub.close().await.unwrap_err().is_transport());
    assert_eq!(sub.unacked(), 0);
    assert_eq!(pending.settlement(), Some(Settlement::Returned));
    assert!(matches!(
        pending.ack().await,
        Err(MqError::InvalidAcknowledgmentState { .. })
    ));
}

#[tokio::test]
async fn test_reject_drops_and_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "verdicts").await;
    publish(&conn, "verdicts", 2).await;
    let mut sub = conn.open("verdicts", 1).await.unwrap();

    let mut first = sub.next_timeout(WAIT).await.unwrap().unwrap();
    first.reject().await.unwrap();
    assert_eq!(first.settlement(), Some(Settlement::Rejected));

    let mut second = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(second.id(), Some("m1"));
    second.requeue().await.unwrap();

    let mut again = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(again.id(), Some("m1"));
    assert!(again.redelivered());
    again.ack().await.unwrap();

    assert_eq!(broker.queue_depth("verdicts"), Some(0));
    assert!(sub.next_timeout(SHORT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_undecodable_body_is_rejected() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "raw").await;

    let channel = broker.connect(&endpoint()).await.unwrap();
    channel
        .publish(OutboundMessage {
            exchange: String::new(),
            routing_key: "raw".to_string(),
            message_id: "broken".to_string(),
            body: b"{not json".to_vec(),
            persistent: false,
        })
        .await
        .unwrap();
    publish(&conn, "raw", 1).await;

    let mut sub = conn.open("raw", 1).await.unwrap();
    let err = sub.next_timeout(WAIT).await.unwrap_err();
    assert!(matches!(err, MqError::Codec(_)));
    assert_eq!(sub.unacked(), 0);

    // the slot is free again for the next message
    let good = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(good.id(), Some("m0"));
}

#[tokio::test]
async fn test_typed_body_access() {
    #[derive(serde::Deserialize)]
    struct Plan {
        n: usize,
    }

    let broker = MemoryBroker::new();
    let conn = connected(&broker, "typed").await;
    publish(&conn, "typed", 1).await;

    let mut sub = conn.open("typed", 1).await.unwrap();
    let delivery = sub.next_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(delivery.body_as::<Plan>().unwrap().n, 0);
    assert!(delivery.body_as::<Vec<Value>>().is_err());
}

#[tokio::test]
async fn test_open_validates_prefetch_and_queue() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "present").await;

    assert!(matches!(
        conn.open("present", 0).await,
        Err(MqError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.open("absent", 1).await,
        Err(MqError::BrokerProtocol { .. })
    ));
}

#[tokio::test]
async fn test_ack_after_connection_closed_fails() {
    let broker = MemoryBroker::new();
    let mut conn = connected(&broker, "late").await;
    publish(&conn, "late", 1).await;

    let mut sub = conn.open("late", 1).await.unwrap();
    let mut delivery = sub.next_timeout(WAIT).await.unwrap().unwrap();
    conn.close().await;

    assert!(matches!(
        delivery.ack().await,
        Err(MqError::ConnectionClosed)
    ));
    // broker took the message back when the channel closed
    assert_eq!(broker.queue_depth("late"), Some(1));
}

#[tokio::test]
async fn test_subscription_as_stream() {
    let broker = MemoryBroker::new();
    let conn = connected(&broker, "streamed").await;
    publish(&conn, "streamed", 3).await;

    let sub = conn.open("streamed", 3).await.unwrap();
    let cancel = sub.cancel_handle();
    let mut stream = Box::pin(sub.into_stream());

    let mut ids = Vec::new();
    while let Some(delivery) = stream.next().await {
        let mut delivery = delivery.unwrap();
        ids.push(delivery.id().unwrap().to_string());
        delivery.ack().await.unwrap();
        if ids.len() == 3 {
            cancel.cancel();
        }
    }
    assert_eq!(ids, ["m0", "m1", "m2"]);
}
