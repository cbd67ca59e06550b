//! Request/reply and fire-and-forget through a running listener.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use remote_fn::bus::Connector;
use remote_fn::envelope::decode_response_raw;
use remote_fn::{
    CallError, CallOptions, CallRequest, ExceptionRegistry, Handler, Registration, Registry,
    ValidationError,
};
use serde_json::json;

use crate::functions::InsufficientFunds;
use crate::support::{eventually, registry, serve};

#[tokio::test]
async fn call_returns_result() {
    let h = serve(registry()).await;

    let sum: i64 = h
        .client
        .call_as("math", "add", CallRequest::new().arg(2).arg(3))
        .await
        .unwrap();
    assert_eq!(sum, 5);

    let sum: i64 = h
        .client
        .call_as("math", "add", CallRequest::new().kwarg("a", 2).kwarg("b", 40))
        .await
        .unwrap();
    assert_eq!(sum, 42);

    let stats = h.handle.stop().await;
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.replied, 2);
}

#[tokio::test]
async fn optional_arguments() {
    let h = serve(registry()).await;
    let plain = h
        .client
        .call("math", "greet", CallRequest::new().arg("pat"))
        .await
        .unwrap();
    assert_eq!(plain, json!("hello pat"));

    let loud = h
        .client
        .call("math", "greet", CallRequest::new().arg("pat").kwarg("punctuation", "!"))
        .await
        .unwrap();
    assert_eq!(loud, json!("hello pat!"));
    h.handle.stop().await;
}

#[tokio::test]
async fn remote_failure_carries_message() {
    let h = serve(registry()).await;

    let err = h
        .client
        .call("math", "fail", CallRequest::new().arg("bad input"))
        .await
        .unwrap_err();
    let failure = err.remote().expect("remote failure");
    assert_eq!(failure.kind(), "ValueError");
    assert!(err.to_string().contains("bad input"));

    let raw = h
        .client
        .call_raw("math", "fail", CallRequest::new().arg("bad input"))
        .await
        .unwrap();
    assert_eq!(
        raw,
        json!({ "success": false, "error": "ValueError", "message": "bad input" })
    );
    h.handle.stop().await;
}

#[tokio::test]
async fn registered_exception_is_rebuilt() {
    let h = serve(registry()).await;
    let mut exceptions = ExceptionRegistry::default();
    exceptions.register::<InsufficientFunds>();
    let client = h.client.clone().with_exceptions(exceptions);

    let left: u64 = client
        .call_as("bank", "withdraw", CallRequest::new().arg(100).arg(30))
        .await
        .unwrap();
    assert_eq!(left, 70);

    let err = client
        .call("bank", "withdraw", CallRequest::new().arg(10).arg(30))
        .await
        .unwrap_err();
    let failure = err.remote().unwrap();
    assert_eq!(
        failure.downcast_ref::<InsufficientFunds>(),
        Some(&InsufficientFunds {
            balance: 10,
            requested: 30
        })
    );

    // A client that does not know the kind still gets kind and message.
    let err = h
        .client
        .call("bank", "withdraw", CallRequest::new().arg(10).arg(30))
        .await
        .unwrap_err();
    let failure = err.remote().unwrap();
    assert_eq!(failure.kind(), "InsufficientFunds");
    assert!(!failure.is_reconstructed());
    assert!(failure.message_text().contains("cannot withdraw 30"));
    h.handle.stop().await;
}

#[tokio::test]
async fn validation_errors_keep_fields() {
    let h = serve(registry()).await;
    let err = h
        .client
        .call("math", "sign_up", CallRequest::new())
        .await
        .unwrap_err();
    let failure = err.remote().unwrap();
    assert_eq!(failure.message(), &json!({ "email": ["is required"] }));
    let original = failure.downcast_ref::<ValidationError>().unwrap();
    assert_eq!(original.fields["email"], vec!["is required".to_string()]);
    h.handle.stop().await;
}

#[tokio::test]
async fn unknown_function_gets_failure_envelope() {
    let h = serve(registry()).await;
    let raw = h
        .client
        .call_raw("math", "nope", CallRequest::new())
        .await
        .unwrap();
    assert_eq!(raw["success"], json!(false));
    assert_eq!(raw["error"], json!("UnknownFunctionError"));

    let err = h
        .client
        .call("math", "nope", CallRequest::new())
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), "UnknownFunctionError");
    h.handle.stop().await;
}

#[tokio::test]
async fn bad_arguments_are_type_errors() {
    let h = serve(registry()).await;
    let err = h
        .client
        .call("math", "add", CallRequest::new().arg(1).arg(2).arg(3))
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), "TypeError");

    let err = h
        .client
        .call("math", "add", CallRequest::new().arg("one").arg(2))
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().kind(), "TypeError");
    h.handle.stop().await;
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let mut registry = Registry::new();
    registry
        .register_handler(
            Registration::new().namespace("a").name("who"),
            Handler::blocking(|_| Ok(json!("a"))),
        )
        .unwrap();
    registry
        .register_handler(
            Registration::new().namespace("b").name("who"),
            Handler::blocking(|_| Ok(json!("b"))),
        )
        .unwrap();
    let h = serve(registry).await;

    assert_eq!(h.client.call("a", "who", CallRequest::new()).await.unwrap(), json!("a"));
    assert_eq!(h.client.call("b", "who", CallRequest::new()).await.unwrap(), json!("b"));

    // Namespace `c` has no subscription at all.
    let err = h.client.call("c", "who", CallRequest::new()).await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
    h.handle.stop().await;
}

#[tokio::test]
async fn durable_only_namespace_answers_unknown_function() {
    let mut registry = Registry::with_namespace("jobs");
    registry
        .register_handler(
            Registration::new().name("run").durable(true),
            Handler::blocking(|_| Ok(json!("done"))),
        )
        .unwrap();
    let h = serve(registry).await;

    let raw = h
        .client
        .call_raw("jobs", "missing", CallRequest::new())
        .await
        .unwrap();
    assert_eq!(raw["success"], json!(false));
    assert_eq!(raw["error"], json!("UnknownFunctionError"));
    h.handle.stop().await;
}

#[tokio::test]
async fn unregistered_durable_subject_gets_failure_reply() {
    let h = serve(registry()).await;
    let conn = h.bus.connect().await.unwrap();
    let reply = conn
        .request("math.js.missing", b"{}".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    let raw = decode_response_raw(&reply.payload).unwrap();
    assert_eq!(raw["success"], json!(false));
    assert_eq!(raw["error"], json!("UnknownFunctionError"));
    conn.close().await.unwrap();

    let stats = h.handle.stop().await;
    assert_eq!(stats.replied, 1);
}

#[tokio::test]
async fn timeout_releases_connection() {
    let h = serve(registry()).await;

    let started = Instant::now();
    let err = h
        .client
        .call_with(
            "math",
            "slow",
            CallRequest::new().arg(300),
            CallOptions::timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.remote().is_none());
    assert!(started.elapsed() < Duration::from_millis(300));

    // The listener's connection stays open; the call's was closed once.
    assert_eq!(h.bus.connections_opened(), 2);
    assert_eq!(h.bus.connections_closed(), 1);
    h.handle.stop().await;
}

#[tokio::test]
async fn messages_are_handled_concurrently() {
    let h = serve(registry()).await;

    let started = Instant::now();
    let (a, b) = tokio::join!(
        h.client.call("math", "slow", CallRequest::new().arg(150)),
        h.client.call("math", "slow", CallRequest::new().arg(150)),
    );
    assert_eq!(a.unwrap(), json!(150));
    assert_eq!(b.unwrap(), json!(150));
    assert!(started.elapsed() < Duration::from_millis(290));
    h.handle.stop().await;
}

#[tokio::test]
async fn send_is_fire_and_forget() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut registry = Registry::with_namespace("log");
    registry
        .register_handler(
            Registration::new().name("write").inline(),
            Handler::blocking(move |req| {
                let line: String = req.bind(0, "line")?;
                sink.lock().unwrap().push(line);
                Ok(json!(null))
            }),
        )
        .unwrap();
    let h = serve(registry).await;

    h.client
        .send("log", "write", CallRequest::new().arg("first"))
        .await
        .unwrap();
    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(*seen.lock().unwrap(), vec!["first".to_string()]);

    // Nothing was replied and the send's connection was released.
    let stats = h.handle.stop().await;
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.replied, 0);
    assert_eq!(h.bus.open_connections(), 0);
}
