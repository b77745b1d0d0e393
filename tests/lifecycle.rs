//! Bus lifecycle: start, stop and consumer restart.

mod support;

use std::time::Duration;

use serde_json::json;

use groupcast::{BusError, Group};
use support::{event, test_bus, wait_until, CountingListener, MailboxKey, TestInfra};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn operations_require_a_running_bus() {
    let infra = TestInfra::new();
    let bus = test_bus(&infra);

    let err = bus
        .register(CountingListener::asynchronous(), Group::new("indexer"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BusError::NotRunning));

    let err = bus
        .register_key(
            CountingListener::asynchronous(),
            &MailboxKey("inbox-1".into()),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BusError::NotRunning));

    let err = bus.dispatch(event(json!({})), &[]).await.unwrap_err();
    assert!(matches!(err, BusError::NotRunning));

    let err = bus
        .re_deliver(&Group::new("indexer"), event(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotRunning));
}

#[tokio::test]
async fn a_stopped_bus_rejects_dispatch() {
    let infra = TestInfra::new();
    let bus = test_bus(&infra);
    bus.start().await.unwrap();
    bus.stop().await;

    let err = bus.dispatch(event(json!({})), &[]).await.unwrap_err();
    assert!(matches!(err, BusError::NotRunning));
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let infra = TestInfra::new();
    let bus = test_bus(&infra);

    bus.start().await.unwrap();
    bus.start().await.unwrap();

    let listener = CountingListener::asynchronous();
    bus.register(listener.clone(), Group::new("indexer"))
        .await
        .unwrap();
    bus.dispatch(event(json!({})), &[]).await.unwrap();
    assert!(wait_until(|| listener.count() == 1, WAIT).await);

    bus.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn stop_disposes_group_consumers() {
    let infra = TestInfra::new();
    let consumer = test_bus(&infra);
    let publisher = test_bus(&infra);
    consumer.start().await.unwrap();
    publisher.start().await.unwrap();

    let listener = CountingListener::asynchronous();
    consumer
        .register(listener.clone(), Group::new("indexer"))
        .await
        .unwrap();
    consumer.stop().await;

    publisher.dispatch(event(json!({})), &[]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.count(), 0);
    assert!(consumer.list_registered_groups().is_empty());
}

#[tokio::test]
async fn restart_keeps_both_delivery_paths_working() {
    let infra = TestInfra::new();
    let bus = test_bus(&infra);
    bus.start().await.unwrap();

    let group_listener = CountingListener::asynchronous();
    let key_listener = CountingListener::asynchronous();
    bus.register(group_listener.clone(), Group::new("indexer"))
        .await
        .unwrap();
    bus.register_key(key_listener.clone(), &MailboxKey("inbox-1".into()))
        .await
        .unwrap();

    bus.restart().await.unwrap();

    bus.dispatch(event(json!({})), &[MailboxKey::arc("inbox-1")])
        .await
        .unwrap();

    assert!(wait_until(|| group_listener.count() == 1 && key_listener.count() == 1, WAIT).await);
}

#[tokio::test]
async fn restart_requires_a_running_bus() {
    let infra = TestInfra::new();
    let bus = test_bus(&infra);

    let err = bus.restart().await.unwrap_err();
    assert!(matches!(err, BusError::NotRunning));
}
