//! Forwards admitted requests to their backend and streams the response back.

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, Request, Response, Uri};
use http_body::Body as _;
use std::sync::Arc;
use std::time::Instant;

use super::{Backend, BackendFailure, CircuitBreakerRegistry, ServiceEndpoint, ServiceRegistry};
use crate::context::{Deadline, ProxyRequestContext, CORRELATION_ID_HEADER};
use crate::error::GatewayError;
use crate::health::{HealthRegistry, HealthStatus};

pub const GATEWAY_SERVICE_HEADER: &str = "x-gateway-service";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Prefixes of headers only the gateway may set on forwarded requests.
const GATEWAY_OWNED_PREFIXES: &[&str] = &["x-user-", "x-gateway-", "x-forwarded-", "x-internal-"];

const GATEWAY_OWNED: &[&str] = &["forwarded", "x-real-ip", CORRELATION_ID_HEADER];

fn is_gateway_owned(name: &HeaderName) -> bool {
    let name = name.as_str();
    GATEWAY_OWNED.contains(&name) || GATEWAY_OWNED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Drops hop-by-hop headers and any listed in the `Connection` header.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// What is needed to rebuild a bodiless request for a retry.
struct RetryTemplate {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl RetryTemplate {
    fn build(&self) -> Request<Body> {
        let mut request = Request::new(Body::empty());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

#[derive(Debug, Clone)]
pub struct ProxyDispatcher {
    services: Arc<ServiceRegistry>,
    health: Option<Arc<HealthRegistry>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl ProxyDispatcher {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            services,
            health: None,
            breakers: None,
        }
    }

    /// Fail fast for services the health poller last saw unhealthy.
    #[must_use]
    pub fn with_health_gate(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    #[must_use]
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Forwards `req` to the route's service and returns the streaming response.
    ///
    /// The request body is streamed without buffering. A GET or HEAD with a known
    /// empty body is retried once when the first attempt failed before any
    /// response arrived and the deadline still has time left.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        ctx: &ProxyRequestContext,
        deadline: Deadline,
    ) -> Result<Response<Body>, GatewayError> {
        let service_name = ctx.route.service.as_str();
        let service = self
            .services
            .get(service_name)
            .ok_or_else(|| GatewayError::BackendUnreachable {
                service: service_name.to_owned(),
                reason: "service not registered".into(),
            })?;

        if let Some(health) = &self.health {
            if health.status(service_name) == HealthStatus::Unhealthy {
                return Err(GatewayError::BackendUnhealthy {
                    service: service_name.to_owned(),
                });
            }
        }

        let breaker = self.breakers.as_ref().map(|b| b.get_or_create(service_name));
        if let Some(breaker) = &breaker {
            breaker.allow_request()?;
        }

        let started = Instant::now();
        let result = self.forward(req, ctx, service, deadline).await;
        let elapsed = started.elapsed();

        let route = ctx.route.prefix.as_str();
        let outcome = match &result {
            Ok(response) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
                tracing::info!(
                    correlation_id = %ctx.correlation_id,
                    route,
                    service = service_name,
                    status = response.status().as_u16(),
                    latency_ms = elapsed.as_millis() as u64,
                    "request dispatched"
                );
                "ok"
            }
            Err(err) => {
                if let Some(breaker) = &breaker {
                    if err.is_backend_failure() {
                        breaker.record_failure();
                    }
                }
                tracing::error!(
                    correlation_id = %ctx.correlation_id,
                    route,
                    service = service_name,
                    error = %err,
                    latency_ms = elapsed.as_millis() as u64,
                    "dispatch failed"
                );
                err.error_type()
            }
        };

        metrics::counter!(
            "gateway.dispatch",
            "service" => service_name.to_owned(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("gateway.dispatch.duration", "service" => service_name.to_owned())
            .record(elapsed.as_secs_f64());

        result
    }

    async fn forward(
        &self,
        req: Request<Body>,
        ctx: &ProxyRequestContext,
        service: &ServiceEndpoint,
        deadline: Deadline,
    ) -> Result<Response<Body>, GatewayError> {
        let upstream = self.build_upstream(req, ctx)?;

        let retry = (matches!(*upstream.method(), Method::GET | Method::HEAD)
            && upstream.body().size_hint().exact() == Some(0))
        .then(|| RetryTemplate {
            method: upstream.method().clone(),
            uri: upstream.uri().clone(),
            headers: upstream.headers().clone(),
        });

        let backend: &dyn Backend = service.backend.as_ref();
        let first = backend.send(upstream, deadline).await;

        let outcome = match (first, retry) {
            (Err(failure), Some(template)) if failure.is_retryable() && !deadline.is_expired() => {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    service = %service.name,
                    error = %failure,
                    "retrying idempotent request"
                );
                backend.send(template.build(), deadline).await
            }
            (first, _) => first,
        };

        let mut response = outcome.map_err(|failure| map_failure(&service.name, failure))?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }

    /// Rewrites the inbound request for the backend and injects gateway headers.
    fn build_upstream(
        &self,
        req: Request<Body>,
        ctx: &ProxyRequestContext,
    ) -> Result<Request<Body>, GatewayError> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{query}", ctx.upstream_path),
            None => ctx.upstream_path.clone(),
        };
        parts.uri = path_and_query
            .parse()
            .map_err(|e| GatewayError::RequestBuildFailed(format!("upstream uri: {e}")))?;

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);
        let owned: Vec<HeaderName> = headers
            .keys()
            .filter(|name| is_gateway_owned(name))
            .cloned()
            .collect();
        for name in owned {
            headers.remove(name);
        }

        let mut inject = |name: &'static str, value: &str| -> Result<(), GatewayError> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::RequestBuildFailed(format!("{name}: {e}")))?;
            headers.insert(name, value);
            Ok(())
        };

        inject(CORRELATION_ID_HEADER, ctx.correlation_id.as_str())?;
        inject(GATEWAY_SERVICE_HEADER, &ctx.route.service)?;
        if let Some(addr) = ctx.client_addr {
            inject(FORWARDED_FOR_HEADER, &addr.to_string())?;
        }
        if let Some(identity) = &ctx.identity {
            inject(USER_ID_HEADER, &identity.subject)?;
            inject(USER_ROLE_HEADER, identity.role.as_str())?;
        }

        Ok(Request::from_parts(parts, body))
    }
}

fn map_failure(service: &str, failure: BackendFailure) -> GatewayError {
    let service = service.to_owned();
    match failure {
        BackendFailure::Connect(reason) => GatewayError::BackendUnreachable { service, reason },
        BackendFailure::ConnectTimeout => GatewayError::BackendUnreachable {
            service,
            reason: "connect timed out".into(),
        },
        BackendFailure::Timeout => GatewayError::BackendTimeout { service },
        BackendFailure::Protocol(reason) => GatewayError::BackendBadResponse { service, reason },
    }
}
