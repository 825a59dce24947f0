//! HTTP over handed-off connections.
//!
//! Each accepted connection is served by hyper with keep-alive disabled, so
//! a connection lives for exactly one request and a drain is never held up
//! by idle clients.

use std::io;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use handoff::{Connection, ConnectionHandler, InvocationMode};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceExt;
use tracing::debug;

/// Upper bound for `/slow`, kept inside the connection read deadline.
const MAX_SLOW_MS: u64 = 9_000;

/// Serves the demo router on every connection.
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(mode: InvocationMode) -> Self {
        Self {
            router: create_router(mode),
        }
    }
}

impl ConnectionHandler for HttpHandler {
    async fn handle(&self, conn: Connection) -> io::Result<()> {
        debug!(peer = %conn.peer_addr(), "Serving HTTP connection");

        let router = self.router.clone();
        let service = service_fn(move |req: Request<Incoming>| router.clone().oneshot(req));

        http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(conn), service)
            .await
            .map_err(io::Error::other)
    }
}

/// Create the router for one generation.
pub fn create_router(mode: InvocationMode) -> Router {
    Router::new()
        .route("/", get(hello_handler))
        .route("/health", get(health_handler))
        .route("/slow", get(slow_handler))
        .with_state(mode)
}

async fn hello_handler() -> String {
    format!("hello from {}\n", std::process::id())
}

/// Identifies the generation that answered.
async fn health_handler(State(mode): State<InvocationMode>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "pid": std::process::id(),
        "mode": mode.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

/// Holds the connection open, for watching a drain.
async fn slow_handler(Query(params): Query<SlowParams>) -> String {
    let ms = params.ms.unwrap_or(1_000).min(MAX_SLOW_MS);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    format!("slept {ms} ms in {}\n", std::process::id())
}
