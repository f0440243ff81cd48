//! Per-request orchestration: route, verify, authorize, admit, dispatch.

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::{authorize, TokenVerifier};
use crate::backend::ProxyDispatcher;
use crate::context::{ClientAddr, CorrelationId, Deadline, ProxyRequestContext};
use crate::error::{GatewayError, RequestError};
use crate::middleware::ServiceLabel;
use crate::rate_limit::{caller_key, Admission, RateLimiter};
use crate::routes::SharedRouteTable;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// What is known about a request when it is rejected, for logs and metrics.
#[derive(Debug, Default)]
struct Trail {
    route: Option<String>,
    service: Option<String>,
    subject: Option<String>,
}

/// Runs every stage for one request, short-circuiting on the first rejection.
#[derive(Debug, Clone)]
pub struct GatewayPipeline {
    routes: Arc<SharedRouteTable>,
    verifier: Option<Arc<TokenVerifier>>,
    limiter: Option<Arc<RateLimiter>>,
    dispatcher: ProxyDispatcher,
}

impl GatewayPipeline {
    pub fn new(routes: Arc<SharedRouteTable>, dispatcher: ProxyDispatcher) -> Self {
        Self {
            routes,
            verifier: None,
            limiter: None,
            dispatcher,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn routes(&self) -> &Arc<SharedRouteTable> {
        &self.routes
    }

    /// Handles one request. Rejections become JSON error responses.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let correlation_id = req
            .extensions()
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_else(|| CorrelationId::resolve(req.headers()));

        let mut trail = Trail::default();
        match self.process(req, &correlation_id, &mut trail).await {
            Ok(response) => response,
            Err(err) => {
                log_rejection(&err, &correlation_id, &trail);
                let mut response = err.into_response_with(&correlation_id);
                if let Some(service) = trail.service {
                    response.extensions_mut().insert(ServiceLabel(service));
                }
                response
            }
        }
    }

    async fn process(
        &self,
        req: Request<Body>,
        correlation_id: &CorrelationId,
        trail: &mut Trail,
    ) -> Result<Response, RequestError> {
        let started_at = Instant::now();
        let table = self.routes.load();
        let matched = table
            .resolve(req.uri().path())
            .ok_or_else(|| GatewayError::RouteNotFound(req.uri().path().to_owned()))?;
        let route = Arc::clone(&matched.route);
        trail.route = Some(route.prefix.clone());
        trail.service = Some(route.service.clone());

        let identity = if route.access.auth_required() {
            let verifier = self.verifier.as_ref().ok_or_else(|| {
                GatewayError::Config("route requires authentication but no verifier is configured".into())
            })?;
            let identity = verifier.verify(req.headers()).await?;
            trail.subject = Some(identity.subject.clone());
            Some(identity)
        } else {
            None
        };

        authorize(identity.as_ref(), &route.access, &matched.params).into_result()?;

        let client_addr = req.extensions().get::<ClientAddr>().map(|ClientAddr(addr)| *addr);
        let admission = match &self.limiter {
            Some(limiter) => {
                let key = caller_key(identity.as_ref(), client_addr);
                match limiter.admit(&key, route.traffic_class).await {
                    Admission::Rejected(e) => return Err(e.into()),
                    admitted => Some(admitted),
                }
            }
            None => None,
        };

        let ctx = ProxyRequestContext {
            correlation_id: correlation_id.clone(),
            route: Arc::clone(&route),
            params: matched.params,
            upstream_path: matched.upstream_path,
            identity,
            client_addr,
            started_at,
        };
        let deadline = Deadline::after(route.timeout);

        let mut response = self.dispatcher.dispatch(req, &ctx, deadline).await?;

        if let Some(Admission::Admitted {
            limit,
            remaining,
            reset_at_ms,
        }) = admission
        {
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
            headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(reset_at_ms.div_ceil(1000)));
        }
        response
            .extensions_mut()
            .insert(ServiceLabel::new(route.service.clone()));

        Ok(response)
    }
}

fn log_rejection(err: &RequestError, correlation_id: &CorrelationId, trail: &Trail) {
    let route = trail.route.as_deref().unwrap_or("-");
    let subject = trail.subject.as_deref().unwrap_or("-");

    match err {
        RequestError::Auth(_) | RequestError::Authz(_) => {
            tracing::warn!(
                correlation_id = %correlation_id,
                route,
                subject,
                reason = err.error_type(),
                "request rejected"
            );
            metrics::counter!("gateway.auth.rejected", "reason" => err.error_type()).increment(1);
        }
        RequestError::RateLimited(e) => {
            tracing::warn!(
                correlation_id = %correlation_id,
                route,
                subject,
                scope = e.scope,
                retry_after_secs = e.retry_after_secs(),
                "rate limit exceeded"
            );
            metrics::counter!("gateway.rate_limit.rejected", "scope" => e.scope).increment(1);
        }
        RequestError::Gateway(GatewayError::RouteNotFound(path)) => {
            tracing::debug!(correlation_id = %correlation_id, path, "no route matched");
        }
        RequestError::Gateway(
            e @ (GatewayError::BackendUnhealthy { .. } | GatewayError::CircuitOpen { .. }),
        ) => {
            tracing::warn!(
                correlation_id = %correlation_id,
                route,
                subject,
                error = %e,
                "backend unavailable"
            );
        }
        // Dispatch failures are logged by the dispatcher itself.
        RequestError::Gateway(e) if e.is_backend_failure() => {}
        RequestError::Gateway(e) => {
            tracing::error!(
                correlation_id = %correlation_id,
                route,
                subject,
                error = %e,
                "request failed"
            );
        }
    }
}
