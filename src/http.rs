//! HTTP gateway. Maps HTTP requests onto dispatch, bypassing the bus.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `POST /:namespace/:name`: body is a request envelope, response is
//!   the response envelope. Status 200 on success, 404 for an unknown
//!   function, 400 for a malformed payload or bad arguments, 500 when the
//!   handler fails.
//! - `GET /health`: `{ "ok": true, "subjects": [...] }`.
//!
//! ## Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(Arc::new(registry));
//! remote_fn::http::serve(dispatcher, "0.0.0.0:3000").await?;
//! ```

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::dispatcher::{log_failure, Dispatcher};
use crate::envelope::{encode_response, CallResponse};
use crate::subject;

/// Build an axum `Router` that dispatches through `dispatcher`.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/:namespace/:name", post(call_handler))
        .with_state(dispatcher)
}

/// Serve the gateway at the given address (e.g. `"0.0.0.0:3000"`).
pub async fn serve(dispatcher: Dispatcher, addr: &str) -> Result<(), std::io::Error> {
    let app = router(dispatcher);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "http gateway listening");
    axum::serve(listener, app).await
}

async fn health_handler(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    let mut subjects: Vec<&str> = dispatcher.registry().subjects().collect();
    subjects.sort_unstable();
    Json(json!({ "ok": true, "subjects": subjects }))
}

async fn call_handler(
    State(dispatcher): State<Dispatcher>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let subject = subject::function_subject(&namespace, &name, false);
    let (status, response) = match dispatcher.dispatch(&subject, &body).await {
        Ok(result) => (StatusCode::OK, CallResponse::Success { result }),
        Err(e) => {
            log_failure(&subject, &e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, e.to_response())
        }
    };
    match encode_response(&response) {
        Ok(bytes) => (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            let body: Value = json!({ "success": false, "error": "EncodeError", "message": e.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}
