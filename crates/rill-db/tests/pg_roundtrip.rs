//! Round-trip tests against a live PostgreSQL.
//!
//! Ignored by default; run with a scratch database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/rill_test cargo test -p rill-db -- --ignored
//! ```
//!
//! Each test uses its own stream and subscription names so the suite can
//! run repeatedly against the same database.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use uuid::Uuid;

use rill_db::{
    EventData, EventStore, ExpectedVersion, StoreConfig, StoreError, Subscription,
    SubscriptionMessage, SubscriptionOptions,
};

const WAIT: Duration = Duration::from_secs(10);

async fn connect() -> EventStore {
    let url = std::env::var("DATABASE_URL")
        .expect("set DATABASE_URL to run the live PostgreSQL suite");
    let mut config = StoreConfig::new(url);
    config.lock_retry_interval_ms = 50;
    let store = EventStore::connect(config).await.expect("connect");
    store.initialize().await.expect("initialize schema");
    store
}

fn scratch(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn payloads(n: usize) -> Vec<EventData> {
    (0..n)
        .map(|i| EventData::new("test_event", Bytes::from(format!("payload-{i}"))))
        .collect()
}

async fn expect_subscribed(sub: &mut Subscription<rill_db::RecordedEvent>) {
    match timeout(WAIT, sub.recv()).await {
        Ok(Some(SubscriptionMessage::Subscribed)) => {}
        other => panic!("expected subscribed notice, got {other:?}"),
    }
}

async fn collect_events(
    sub: &mut Subscription<rill_db::RecordedEvent>,
    count: usize,
) -> Vec<rill_db::RecordedEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        match timeout(WAIT, sub.recv()).await {
            Ok(Some(SubscriptionMessage::Events(batch))) => events.extend(batch),
            other => panic!("expected events, got {other:?}"),
        }
    }
    events
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL via DATABASE_URL"]
async fn test_pg_append_read_round_trip() {
    let store = connect().await;
    let stream = scratch("orders");

    let recorded = store
        .append_to_stream(&stream, ExpectedVersion::Exact(0), payloads(3))
        .await
        .unwrap();
    assert_eq!(
        recorded.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let read = store.read_stream(&stream, 1, 10).await.unwrap();
    assert_eq!(read, recorded);

    // Optimistic concurrency is enforced.
    let err = store
        .append_to_stream(&stream, ExpectedVersion::Exact(0), payloads(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rill_db::DbError::Store(StoreError::WrongExpectedVersion { .. })
    ));

    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL via DATABASE_URL"]
async fn test_pg_read_missing_stream() {
    let store = connect().await;
    let err = store.read_stream(&scratch("void"), 1, 10).await.unwrap_err();
    assert!(matches!(
        err,
        rill_db::DbError::Store(StoreError::StreamNotFound(_))
    ));
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL via DATABASE_URL"]
async fn test_pg_subscription_live_delivery() {
    let store = connect().await;
    let stream = scratch("orders");

    let mut sub = store
        .subscribe_to_stream(&stream, "live-check", SubscriptionOptions::new())
        .await
        .unwrap();
    expect_subscribed(&mut sub).await;

    // The commit's NOTIFY drives delivery end to end.
    store
        .append_to_stream(&stream, ExpectedVersion::Any, payloads(3))
        .await
        .unwrap();
    let events = collect_events(&mut sub, 3).await;
    assert_eq!(
        events.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    sub.ack_events(&events).await;

    store.unsubscribe_from_stream(&stream, "live-check").await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL via DATABASE_URL"]
async fn test_pg_ack_survives_reconnect() {
    let store = connect().await;
    let stream = scratch("orders");

    store
        .append_to_stream(&stream, ExpectedVersion::Any, payloads(3))
        .await
        .unwrap();

    let mut sub = store
        .subscribe_to_stream(&stream, "resume-check", SubscriptionOptions::new())
        .await
        .unwrap();
    expect_subscribed(&mut sub).await;
    let events = collect_events(&mut sub, 3).await;
    sub.ack_events(&events).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    drop(sub);

    // A fresh subscriber under the same name resumes past the ack, even
    // across a new store connection.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut sub = store
        .subscribe_to_stream(&stream, "resume-check", SubscriptionOptions::new())
        .await
        .unwrap();
    expect_subscribed(&mut sub).await;

    store
        .append_to_stream(&stream, ExpectedVersion::Any, payloads(1))
        .await
        .unwrap();
    let events = collect_events(&mut sub, 1).await;
    assert_eq!(events[0].stream_version, 4);

    store.unsubscribe_from_stream(&stream, "resume-check").await.unwrap();
    store.close().await.unwrap();
}
