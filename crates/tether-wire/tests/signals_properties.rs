//! Remote signal subscriptions and property access through proxies.

mod common;

use common::{client, config, counter, eventually, serving};
use std::time::Duration;
use tether_types::{DynamicValue, Error};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_remote_signal_delivery() {
    let (server, url) = serving(config("server")).await;
    let original = counter();
    server.register_object("counter", &original).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = proxy
        .subscribe_named("ticked", move |payload| {
            let _ = tx.send(payload.to_vec());
        })
        .await
        .unwrap();
    let ticked = original.meta().find_signal("ticked").unwrap();
    assert_eq!(original.subscriber_count(ticked), 1);

    original
        .emit_named("ticked", vec![DynamicValue::Int32(7)])
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, vec![DynamicValue::Int32(7)]);

    // Emitting on the proxy fires on the original, which forwards back.
    proxy.emit_named("ticked", vec![DynamicValue::Int32(8)]).unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, vec![DynamicValue::Int32(8)]);

    proxy.unsubscribe(subscription);
    assert!(eventually(|| original.subscriber_count(ticked) == 0).await);
}

#[tokio::test]
async fn test_second_local_subscriber_shares_remote_link() {
    let (server, url) = serving(config("server")).await;
    let original = counter();
    server.register_object("counter", &original).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();
    let ticked = original.meta().find_signal("ticked").unwrap();

    let first = proxy.subscribe(ticked, |_| {}).await.unwrap();
    let second = proxy.subscribe(ticked, |_| {}).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(proxy.subscriber_count(ticked), 2);
    assert_eq!(original.subscriber_count(ticked), 1);

    proxy.unsubscribe(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(original.subscriber_count(ticked), 1);
    proxy.unsubscribe(second);
    assert!(eventually(|| original.subscriber_count(ticked) == 0).await);
}

#[tokio::test]
async fn test_unsubscribe_before_remote_answer_releases_link() {
    let (server, url) = serving(config("server")).await;
    let original = counter();
    server.register_object("counter", &original).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();
    let ticked = original.meta().find_signal("ticked").unwrap();

    // Subscription ids on a fresh object start at 1.
    let pending = proxy.subscribe(ticked, |_| {});
    proxy.unsubscribe(1);
    assert_eq!(pending.await.unwrap(), 1);
    assert_eq!(proxy.subscriber_count(ticked), 0);
    assert!(eventually(|| original.subscriber_count(ticked) == 0).await);

    // Leave and come back before the first answer: one link survives.
    let first = proxy.subscribe(ticked, |_| {});
    proxy.unsubscribe(2);
    let second = proxy.subscribe(ticked, |_| {}).await.unwrap();
    assert_eq!(first.await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(original.subscriber_count(ticked), 1);

    proxy.unsubscribe(second);
    assert!(eventually(|| original.subscriber_count(ticked) == 0).await);
}

#[tokio::test]
async fn test_remote_property_get_set_and_watch() {
    let (server, url) = serving(config("server")).await;
    let original = counter();
    server.register_object("counter", &original).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    assert_eq!(
        proxy.property_named("level").await.unwrap(),
        DynamicValue::Int32(1)
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    proxy
        .subscribe_named("level", move |payload| {
            let _ = tx.send(payload.to_vec());
        })
        .await
        .unwrap();

    proxy
        .set_property_named("level", DynamicValue::Int32(5))
        .await
        .unwrap();
    assert_eq!(
        original.property_named("level").await.unwrap(),
        DynamicValue::Int32(5)
    );
    let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change, vec![DynamicValue::Int32(5)]);

    let err = proxy
        .set_property_named("level", DynamicValue::from("high"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SignatureMismatch(_) | Error::TypeMismatch { .. }
    ));
}

#[tokio::test]
async fn test_subscribing_to_unknown_member_fails() {
    let (server, url) = serving(config("server")).await;
    server.register_object("counter", &counter()).unwrap();
    let (_client, conn) = client("client", &url).await;
    let proxy = conn.get_object("counter").await.unwrap();

    let err = proxy.subscribe_named("nope", |_| {}).await.unwrap_err();
    assert!(matches!(err, Error::NoSuchSignal(_)));
    assert!(matches!(
        proxy.emit_named("nope", vec![]),
        Err(Error::NoSuchSignal(_))
    ));
}
