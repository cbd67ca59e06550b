//! HTTP gateway integration tests.
//!
//! Starts an axum server and exercises it with reqwest.

use std::sync::Arc;

use remote_fn::{http, Dispatcher};
use serde_json::{json, Value};

use crate::support::registry;

/// Bind to port 0 and return the actual address.
async fn start_server() -> String {
    let app = http::router(Dispatcher::new(Arc::new(registry())));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_check() {
    let base = start_server().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert!(body["subjects"]
        .as_array()
        .unwrap()
        .contains(&json!("math.add")));
}

#[tokio::test]
async fn post_call() {
    let base = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/math/add"))
        .json(&json!({ "args": [2, 3] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "success": true, "result": 5 }));
}

#[tokio::test]
async fn status_codes() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/math/missing"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "UnknownFunctionError");

    let resp = client
        .post(format!("{base}/math/add"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{base}/math/fail"))
        .json(&json!({ "args": ["bad input"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({ "success": false, "error": "ValueError", "message": "bad input" })
    );
}
