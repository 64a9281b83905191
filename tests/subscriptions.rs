mod support;

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio::sync::mpsc;

use esdb::streams::ReadResp;
use esdb::{
    AppendOptions, Error, EventData, ReadOptions, StreamPosition, SubscribeOptions,
    SubscriptionMessage,
};
use support::{start, TestNode, HANG};

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

async fn seed(node: &TestNode, stream: &str, count: usize) {
    let events = (0..count)
        .map(|n| EventData::json("counted", &json!({ "n": n })).unwrap())
        .collect::<Vec<_>>();
    node.client
        .append(stream, events, AppendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn subscription_from_revision_zero_delivers_later_events_in_order() {
    let node = start().await;
    seed(&node, "watched", 3).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = node
        .client
        .subscribe(
            tx,
            "watched",
            SubscribeOptions::default().from(StreamPosition::Revision(0)),
        )
        .await
        .unwrap();

    // Exclusive cursor: events 1 and 2, in wire order, nothing else.
    let first = rx.recv().await.unwrap();
    assert_matches!(first, SubscriptionMessage::Event(event) if event.revision() == 1);
    let second = rx.recv().await.unwrap();
    assert_matches!(second, SubscriptionMessage::Event(event) if event.revision() == 2);

    node.client
        .cancel_subscription(&handle, CANCEL_TIMEOUT)
        .await
        .unwrap();
    // The delivery side is gone once the cancellation is acknowledged.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn cancel_is_idempotent_and_stops_delivery() {
    let node = start().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = node
        .client
        .subscribe(tx, "quiet", SubscribeOptions::default())
        .await
        .unwrap();

    node.client
        .cancel_subscription(&handle, CANCEL_TIMEOUT)
        .await
        .unwrap();
    node.client
        .cancel_subscription(&handle, CANCEL_TIMEOUT)
        .await
        .unwrap();

    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn raw_subscriptions_surface_confirmation_markers() {
    let node = start().await;
    seed(&node, "raw-watched", 2).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = node
        .client
        .subscribe(
            tx,
            "raw-watched",
            SubscribeOptions::default()
                .from(StreamPosition::Revision(0))
                .raw(),
        )
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert_matches!(
        first,
        SubscriptionMessage::Raw(ReadResp::Confirmation { subscription_id }) if subscription_id == "test-subscription"
    );
    let second = rx.recv().await.unwrap();
    assert_matches!(second, SubscriptionMessage::Raw(ReadResp::Event(_)));

    node.client
        .cancel_subscription(&handle, CANCEL_TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelling_after_dropping_the_subscriber_is_ok() {
    let node = start().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = node
        .client
        .subscribe(tx, "dropped", SubscribeOptions::default())
        .await
        .unwrap();
    drop(rx);

    node.client
        .cancel_subscription(&handle, CANCEL_TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn subscriptions_outlive_request_deadlines() {
    let node = start().await;
    seed(&node, "durable", 1).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = node
        .client
        .subscribe(
            tx,
            "durable",
            SubscribeOptions::default()
                .from(StreamPosition::Start)
                .timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    // The confirmation deadline is disarmed once the server acknowledges;
    // the catch-up event still arrives well after 200ms would have fired.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let first = rx.recv().await.unwrap();
    assert_matches!(first, SubscriptionMessage::Event(event) if event.revision() == 0);
}

#[tokio::test]
async fn connection_teardown_fails_in_flight_requests_and_later_calls() {
    let node = start().await;
    seed(&node, "before", 1).await;

    let client = node.client.clone();
    let hanging = tokio::spawn(async move {
        client
            .read_chunk(HANG, ReadOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    node.kill_server();

    let result = hanging.await.unwrap();
    assert_matches!(result, Err(Error::Transport(_)));

    // The actor is gone; new work observes the shutdown.
    let result = node.client.read_chunk("before", ReadOptions::default()).await;
    assert_matches!(result, Err(Error::Shutdown | Error::Transport(_)));

    // Push subscribers receive no synthetic message; cancellation of a dead
    // handle stays idempotent Ok.
    let (tx, _rx) = mpsc::unbounded_channel();
    let subscribe = node
        .client
        .subscribe(tx, "before", SubscribeOptions::default())
        .await;
    assert_matches!(subscribe, Err(Error::Shutdown | Error::Transport(_)));
}
