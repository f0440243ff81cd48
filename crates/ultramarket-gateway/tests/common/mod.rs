//! Common test utilities for gateway integration tests.

pub mod fixtures;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::header::CONTENT_LENGTH,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::{self, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ultramarket_gateway::{GatewayConfig, GatewayError, GatewayServer};

/// A backend service that echoes what the gateway forwarded to it.
///
/// Paths containing `/slow` stall long enough to trip any test deadline before
/// answering; paths containing `/stall` send headers and part of the body, then
/// go silent.
pub struct TestBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestBackend {
    pub async fn spawn() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .fallback(echo)
            .with_state(Arc::clone(&hits));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits }
    }

    /// Requests that reached the business surface (health probes excluded).
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn echo(State(hits): State<Arc<AtomicUsize>>, req: Request) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    let (parts, body) = req.into_parts();
    if parts.uri.path().contains("/stall") {
        let partial = stream::iter([Ok::<_, std::io::Error>("{\"par")]).chain(stream::pending());
        return ([(CONTENT_LENGTH, "100")], Body::from_stream(partial)).into_response();
    }
    if parts.uri.path().contains("/slow") {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    let headers: serde_json::Map<String, serde_json::Value> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    let body = to_bytes(body, usize::MAX).await.unwrap();

    Json(serde_json::json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body_len": body.len(),
    }))
    .into_response()
}

/// Address that refuses connections: bound once, then released.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A gateway serving on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub server: Arc<GatewayServer>,
    pub client: reqwest::Client,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), GatewayError>>,
}

impl TestGateway {
    pub async fn start(config: &str) -> Self {
        let config = GatewayConfig::parse(config).unwrap();
        let server = Arc::new(GatewayServer::build(config).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            async move { server.serve_with_listener(listener, cancel).await }
        });

        Self {
            addr,
            server,
            client: reqwest::Client::new(),
            cancel,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn get_as(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.get(path).bearer_auth(token)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
    }
}
