//! Durable pull consumers: at-least-once delivery and the ack policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remote_fn::bus::{Connector, InMemoryBus};
use remote_fn::subject::durable_consumer_name;
use remote_fn::{CallRequest, FunctionError, Handler, Registration, Registry};
use serde_json::json;

use crate::support::{eventually, serve_on, settings};

const CONSUMER: &str = "remote_fn_jobs_js_run";

/// Registry with one durable `jobs.js.run` that counts invocations and
/// fails while the counter is below `fail_first`.
fn jobs(calls: &Arc<AtomicUsize>, fail_first: usize) -> Registry {
    let calls = Arc::clone(calls);
    let mut registry = Registry::with_namespace("jobs");
    registry
        .register_handler(
            Registration::new().name("run").durable(true).inline(),
            Handler::blocking(move |_req| {
                if calls.fetch_add(1, Ordering::SeqCst) < fail_first {
                    Err(FunctionError::new("RuntimeError", "not yet"))
                } else {
                    Ok(json!("done"))
                }
            }),
        )
        .unwrap();
    registry
}

#[test]
fn consumer_name_is_deterministic() {
    assert_eq!(durable_consumer_name("remote_fn", "jobs.js.run"), CONSUMER);
}

#[tokio::test]
async fn success_is_acknowledged() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = serve_on(InMemoryBus::new(), jobs(&calls, 0), settings()).await;
    assert_eq!(h.bus.consumer_names(), vec![CONSUMER.to_string()]);

    h.client
        .send_durable("jobs", "run", CallRequest::new().arg(1))
        .await
        .unwrap();
    assert!(eventually(|| h.bus.ack_count(CONSUMER) == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.bus.pending(CONSUMER), 0);

    let stats = h.handle.stop().await;
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.replied, 0);
}

#[tokio::test]
async fn failures_are_redelivered_until_handled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let bus = InMemoryBus::with_ack_wait(Duration::from_millis(40));
    let h = serve_on(bus, jobs(&calls, 2), settings()).await;

    h.client
        .send_durable("jobs", "run", CallRequest::new())
        .await
        .unwrap();
    assert!(eventually(|| h.bus.ack_count(CONSUMER) == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = h.handle.stop().await;
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn unroutable_messages_are_acked_by_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = serve_on(InMemoryBus::new(), jobs(&calls, 0), settings()).await;

    let conn = h.bus.connect().await.unwrap();
    conn.publish_durable("jobs.js.run", b"not json".to_vec())
        .await
        .unwrap();
    assert!(eventually(|| h.bus.ack_count(CONSUMER) == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = h.handle.stop().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn unroutable_messages_can_be_left_for_redelivery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let settings = settings().with_ack_unroutable(false);
    let h = serve_on(InMemoryBus::new(), jobs(&calls, 0), settings).await;

    let conn = h.bus.connect().await.unwrap();
    conn.publish_durable("jobs.js.run", b"[1, 2]".to_vec())
        .await
        .unwrap();
    let handle = h.handle;
    assert!(eventually(|| handle.stats().failed == 1).await);
    assert_eq!(h.bus.ack_count(CONSUMER), 0);
    assert_eq!(h.bus.pending(CONSUMER), 1);
    handle.stop().await;
}

#[tokio::test]
async fn restart_resumes_the_same_cursor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let bus = InMemoryBus::new();

    let first = serve_on(bus.clone(), jobs(&calls, 0), settings()).await;
    first
        .client
        .send_durable("jobs", "run", CallRequest::new().arg("a"))
        .await
        .unwrap();
    assert!(eventually(|| bus.ack_count(CONSUMER) == 1).await);
    first.handle.stop().await;

    // Published while nobody is listening; the stream keeps it.
    first
        .client
        .send_durable("jobs", "run", CallRequest::new().arg("b"))
        .await
        .unwrap();

    let second = serve_on(bus.clone(), jobs(&calls, 0), settings()).await;
    assert!(eventually(|| bus.ack_count(CONSUMER) == 2).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(bus.consumer_names(), vec![CONSUMER.to_string()]);
    second.handle.stop().await;
}

#[tokio::test]
async fn durable_subjects_skip_the_wildcard_path() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = jobs(&calls, 0);
    registry
        .register_handler(
            Registration::new().name("ping").inline(),
            Handler::blocking(|_| Ok(json!("pong"))),
        )
        .unwrap();
    let h = serve_on(InMemoryBus::new(), registry, settings()).await;

    assert_eq!(
        h.client.call("jobs", "ping", CallRequest::new()).await.unwrap(),
        json!("pong")
    );
    h.client
        .send_durable("jobs", "run", CallRequest::new())
        .await
        .unwrap();
    assert!(eventually(|| h.bus.ack_count(CONSUMER) == 1).await);

    // Give the wildcard subscription a chance to misbehave.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = h.handle.stop().await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.failed, 0);
}
