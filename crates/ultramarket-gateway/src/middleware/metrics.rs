//! Prometheus metrics middleware and server.

use axum::{routing::get, Router};
use http::{Request, Response};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};

use crate::config::MetricsConfig;
use crate::error::GatewayError;

/// Response extension naming the backend service a request was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLabel(pub String);

impl ServiceLabel {
    pub fn new(service: impl Into<String>) -> Self {
        Self(service.into())
    }
}

/// Tower layer that records request metrics.
#[derive(Clone, Default)]
pub struct MetricsLayer;

impl MetricsLayer {
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

/// The service wrapper that records metrics.
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method = req.method().to_string();

        gauge!("gateway.active_requests").increment(1.0);

        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(req).await;
            let duration_secs = start.elapsed().as_secs_f64();

            gauge!("gateway.active_requests").decrement(1.0);

            match &result {
                Ok(response) => {
                    let service = response
                        .extensions()
                        .get::<ServiceLabel>()
                        .map_or_else(|| "unmatched".to_owned(), |label| label.0.clone());
                    let status = response.status();

                    counter!(
                        "gateway.requests",
                        "service" => service.clone(),
                        "method" => method.clone(),
                        "status" => status.as_u16().to_string()
                    )
                    .increment(1);

                    histogram!(
                        "gateway.request.duration",
                        "service" => service.clone(),
                        "method" => method
                    )
                    .record(duration_secs);

                    if status.is_client_error() || status.is_server_error() {
                        let error_type = if status.is_client_error() {
                            "client_error"
                        } else {
                            "server_error"
                        };
                        counter!(
                            "gateway.errors",
                            "service" => service,
                            "error_type" => error_type
                        )
                        .increment(1);
                    }
                }
                Err(_) => {
                    counter!(
                        "gateway.errors",
                        "service" => "unmatched",
                        "error_type" => "internal"
                    )
                    .increment(1);
                }
            }

            result
        })
    }
}

/// Initialise the Prometheus metrics recorder.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, GatewayError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::Config(format!("failed to install metrics recorder: {e}")))
}

/// Run the metrics server on a separate address.
pub async fn run_metrics_server(
    config: &MetricsConfig,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let metrics_handle = Arc::new(handle);
    let path = config.path.clone();

    let app = Router::new().route(
        &path,
        get({
            let handle = Arc::clone(&metrics_handle);
            move || {
                let handle = Arc::clone(&handle);
                async move { handle.render() }
            }
        }),
    );

    let addr = config.bind_address;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(GatewayError::Io)?;

    tracing::info!(address = %addr, path = %path, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(GatewayError::Io)?;

    Ok(())
}

/// Installs the recorder and serves it in a background task.
pub fn spawn_metrics_server(
    config: MetricsConfig,
    cancel: CancellationToken,
) -> Result<
    (
        PrometheusHandle,
        tokio::task::JoinHandle<Result<(), GatewayError>>,
    ),
    GatewayError,
> {
    let handle = init_metrics_recorder()?;
    let server_handle = handle.clone();

    let task =
        tokio::spawn(async move { run_metrics_server(&config, server_handle, cancel).await });

    Ok((handle, task))
}
