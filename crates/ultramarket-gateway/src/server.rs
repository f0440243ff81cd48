//! Gateway server implementation.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::TokenVerifier;
use crate::backend::{CircuitBreakerRegistry, ProxyDispatcher, ServiceRegistry};
use crate::config::{ConfigError, CorsConfig, GatewayConfig};
use crate::error::GatewayError;
use crate::health::{HealthAggregator, HealthRegistry, OverallStatus};
use crate::middleware::{CorrelationLayer, MetricsLayer, SecurityLayer};
use crate::pipeline::GatewayPipeline;
use crate::rate_limit::RateLimiter;
use crate::routes::{RouteTable, SharedRouteTable};

/// Shared state for the operational endpoints and the proxy fallback.
#[derive(Debug, Clone)]
struct AppState {
    pipeline: GatewayPipeline,
    health: Arc<HealthAggregator>,
}

/// A fully wired gateway, ready to serve.
#[derive(Debug)]
pub struct GatewayServer {
    config: GatewayConfig,
    pipeline: GatewayPipeline,
    services: Arc<ServiceRegistry>,
    health: Arc<HealthAggregator>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GatewayServer {
    /// Builds every component from configuration.
    pub fn build(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let services = Arc::new(ServiceRegistry::from_config(&config)?);
        let registry = Arc::new(HealthRegistry::new(config.health.unhealthy_threshold));
        let health = Arc::new(HealthAggregator::new(
            Arc::clone(&services),
            Arc::clone(&registry),
            config.health.probe_timeout,
        ));

        let mut dispatcher = ProxyDispatcher::new(Arc::clone(&services));
        if config.health.enabled && config.health.skip_unhealthy_backends {
            dispatcher = dispatcher.with_health_gate(registry);
        }
        if let Some(cb_config) = &config.middleware.circuit_breaker {
            tracing::info!(
                failure_threshold = cb_config.failure_threshold,
                success_threshold = cb_config.success_threshold,
                reset_timeout_ms = cb_config.reset_timeout.as_millis() as u64,
                "Circuit breaker enabled"
            );
            dispatcher = dispatcher
                .with_circuit_breakers(Arc::new(CircuitBreakerRegistry::new(cb_config.clone())));
        }

        let routes = Arc::new(SharedRouteTable::new(RouteTable::from_config(&config)?));
        let mut pipeline = GatewayPipeline::new(routes, dispatcher);

        if let Some(auth_config) = &config.auth {
            tracing::info!(
                algorithm = ?auth_config.algorithm,
                revocation = auth_config.revocation.is_some(),
                "Token verification enabled"
            );
            pipeline = pipeline.with_verifier(Arc::new(TokenVerifier::from_config(auth_config)?));
        }

        let limiter = if config.rate_limit.enabled {
            let limiter = RateLimiter::from_config(&config.rate_limit)
                .map_err(|e| GatewayError::Config(format!("rate limit store: {e}")))?;
            let limiter = Arc::new(limiter);
            pipeline = pipeline.with_rate_limiter(Arc::clone(&limiter));
            Some(limiter)
        } else {
            tracing::warn!("Rate limiting disabled");
            None
        };

        tracing::info!(
            services = services.len(),
            routes = pipeline.routes().load().len(),
            "Gateway configured"
        );

        Ok(Self {
            config,
            pipeline,
            services,
            health,
            limiter,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<SharedRouteTable> {
        self.pipeline.routes()
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// The full router: operational endpoints plus the proxy fallback.
    pub fn router(&self) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            health: Arc::clone(&self.health),
        };

        let mut router = Router::new()
            .route("/health", get(liveness))
            .route("/health/services", get(services_health))
            .route("/status", get(status))
            .fallback(proxy)
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(self.config.limits.max_body_size));

        if let Some(cors) = cors_layer(&self.config.cors) {
            router = router.layer(cors);
        }

        router
            .layer(SecurityLayer::new(self.config.server.trust_forwarded_headers))
            .layer(MetricsLayer::new())
            .layer(CorrelationLayer::new())
    }

    /// Replaces the route table. Services cannot be added by a reload.
    pub fn reload_routes(&self, config: &GatewayConfig) -> Result<usize, ConfigError> {
        config.validate()?;
        if let Some(route) = config
            .routes
            .iter()
            .find(|route| !self.services.contains(&route.service))
        {
            return Err(ConfigError::Invalid(format!(
                "route '{}' references service '{}' which is not running; restart to add services",
                route.prefix, route.service
            )));
        }

        let table = RouteTable::from_config(config)?;
        let count = table.len();
        self.routes().swap(table);
        tracing::info!(routes = count, "Route table reloaded");
        Ok(count)
    }

    /// Binds the configured address and serves until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(self.config.server.bind_address)
            .await
            .map_err(GatewayError::Io)?;
        self.serve_with_listener(listener, cancel).await
    }

    /// Serves on an already bound listener, running background tasks alongside.
    pub async fn serve_with_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let tasks = self.spawn_background(&cancel)?;

        let addr = listener.local_addr().map_err(GatewayError::Io)?;
        tracing::info!(address = %addr, "Gateway listening");

        let app = self.router();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let drain_deadline = {
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                tokio::time::sleep(shutdown_timeout).await;
            }
        };

        let result = tokio::select! {
            result = server => result.map_err(GatewayError::Io),
            () = drain_deadline => {
                tracing::warn!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Graceful shutdown timed out, dropping open connections"
                );
                Ok(())
            }
        };

        // Background tasks share the token, so stop them even if serving failed.
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        tracing::info!("Gateway shutdown complete");
        result
    }

    fn spawn_background(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>, GatewayError> {
        let mut tasks = Vec::new();

        if self.config.health.enabled {
            tracing::info!(
                interval_secs = self.config.health.interval.as_secs(),
                "Health poller enabled"
            );
            tasks.push(
                self.health
                    .spawn_poller(self.config.health.interval, cancel.clone()),
            );
        }

        if let Some(limiter) = &self.limiter {
            tasks.push(limiter.spawn_sweeper(cancel.clone()));
        }

        if let Some(metrics_config) = &self.config.metrics {
            let (_handle, task) = crate::middleware::metrics::spawn_metrics_server(
                metrics_config.clone(),
                cancel.clone(),
            )?;
            tracing::info!(
                address = %metrics_config.bind_address,
                path = %metrics_config.path,
                "Metrics server enabled"
            );
            tasks.push(tokio::spawn(async move {
                match task.await {
                    Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed"),
                    Err(e) => tracing::error!(error = %e, "Metrics server panicked"),
                    Ok(Ok(())) => {}
                }
            }));
        }

        Ok(tasks)
    }
}

/// Run the gateway server.
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    GatewayServer::build(config)?.serve(cancel).await
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if config.allowed_origins.is_empty() {
        return None;
    }

    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(origin, error = %e, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Liveness: the process is up and serving.
async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy"
    }))
}

/// Probes every backend now and reports the composite status.
async fn services_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_all().await;
    let status = match report.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

/// Last known health without probing.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    state.pipeline.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
        [auth]
        secret = "server-test-secret"

        [services.orders]
        url = "http://127.0.0.1:1"
        critical = true

        [services.products]
        url = "http://127.0.0.1:1"

        [[routes]]
        prefix = "/api/v1/orders"
        service = "orders"

        [[routes]]
        prefix = "/api/v1/products"
        service = "products"
        access = { kind = "public" }

        [health]
        enabled = false
        unhealthy_threshold = 1

        [limits]
        max_body_size = 16
    "#;

    fn server() -> GatewayServer {
        GatewayServer::build(GatewayConfig::parse(CONFIG).unwrap()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness_is_always_healthy() {
        let response = server()
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-correlation-id"));
        assert_eq!(json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn status_reports_without_probing() {
        let response = server()
            .router()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"][0]["status"], "unknown");
    }

    #[tokio::test]
    async fn critical_backend_down_is_unavailable() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/health/services")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["services"][0]["name"], "orders");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/products")
                    .header("content-length", "64")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unmatched_path_carries_correlation_id() {
        let response = server()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/nowhere")
                    .header("x-correlation-id", "trace-404")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-correlation-id"], "trace-404");
        assert_eq!(json(response).await["correlation_id"], "trace-404");
    }

    #[test]
    fn reload_swaps_route_table() {
        let server = server();
        let mut next = GatewayConfig::parse(CONFIG).unwrap();
        next.routes.truncate(1);

        assert_eq!(server.reload_routes(&next).unwrap(), 1);
        assert_eq!(server.routes().load().len(), 1);
    }

    #[test]
    fn reload_rejects_new_services() {
        let server = server();
        let mut next = GatewayConfig::parse(CONFIG).unwrap();
        next.services.insert(
            "search".into(),
            next.services["products"].clone(),
        );
        next.routes[1].service = "search".into();

        assert!(server.reload_routes(&next).is_err());
        assert_eq!(server.routes().load().len(), 2);
    }

    #[test]
    fn cors_disabled_without_origins() {
        assert!(cors_layer(&CorsConfig::default()).is_none());
        assert!(cors_layer(&CorsConfig {
            allowed_origins: vec!["https://shop.example".into()],
        })
        .is_some());
    }
}
