//! Worker pool integration: liveness of event-driven dispatch and
//! shutdown behavior.

use std::time::Duration;

use courier_broker::{CreationMode, Message, SubscriptionMode};
use courier_integration_tests::common::{subscribe_request, test_broker, test_session};

#[tokio::test]
async fn test_posted_event_is_dispatched_within_bound() {
    let broker = test_broker().await;
    let session = test_session("c1");
    broker
        .exchange
        .destination("queue://live", CreationMode::Create)
        .await
        .unwrap();
    let (req, mut rx) =
        subscribe_request("queue://live", "a", &session, SubscriptionMode::Shared);
    broker.exchange.add_subscription(req).await.unwrap();

    broker.exchange.start().await;

    let message = Message::new("m1", "queue://live");
    broker.exchange.save_message(&session, &message).await.unwrap();

    // the drain phase plus the 1s sweep backstop bound delivery latency
    let delivery = tokio::time::timeout(Duration::from_millis(1_500), rx.recv())
        .await
        .expect("delivery within the liveness bound")
        .expect("channel open");
    assert_eq!(delivery.message.message_id, "m1");

    broker.exchange.stop().await;
}

#[tokio::test]
async fn test_stop_halts_dispatch_and_is_idempotent() {
    let broker = test_broker().await;
    let session = test_session("c1");
    broker
        .exchange
        .destination("queue://halt", CreationMode::Create)
        .await
        .unwrap();
    let (req, mut rx) =
        subscribe_request("queue://halt", "a", &session, SubscriptionMode::Shared);
    broker.exchange.add_subscription(req).await.unwrap();

    broker.exchange.start().await;
    assert!(broker.exchange.is_running());

    broker.exchange.stop().await;
    assert!(!broker.exchange.is_running());

    // stopped workers never pick up new work, even past the sweep period
    let message = Message::new("m1", "queue://halt");
    broker.exchange.save_message(&session, &message).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(1_300), rx.recv()).await;
    assert!(outcome.is_err(), "no delivery after stop");

    // stop is safe to repeat when not running
    broker.exchange.stop().await;
    assert!(!broker.exchange.is_running());
}

#[tokio::test]
async fn test_commit_wakes_workers() {
    let broker = test_broker().await;
    let session = test_session("c1");
    broker
        .exchange
        .destination("topic://tx", CreationMode::Create)
        .await
        .unwrap();
    let (req, mut rx) = subscribe_request("topic://tx", "a", &session, SubscriptionMode::Shared);
    broker.exchange.add_subscription(req).await.unwrap();

    broker.exchange.start().await;

    broker.exchange.begin(&session, "topic://tx").await.unwrap();
    let message = Message::new("m1", "topic://tx");
    broker.exchange.save_message(&session, &message).await.unwrap();

    // staged work is not observable before commit
    let early = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(early.is_err());

    broker.exchange.commit(&session, "topic://tx").await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_millis(1_500), rx.recv())
        .await
        .expect("delivery after commit")
        .expect("channel open");
    assert_eq!(delivery.message.message_id, "m1");

    broker.exchange.stop().await;
}
