//! Security middleware for header sanitisation and response headers.

use axum::extract::ConnectInfo;
use axum::http::header::{
    HeaderName, HeaderValue, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use http::{HeaderMap, Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::context::ClientAddr;

/// Headers that should be stripped from client requests.
const STRIP_HEADERS: &[&str] = &["x-real-ip", "forwarded", "transfer-encoding", "connection", "upgrade"];

/// Header prefixes reserved for values the gateway itself asserts.
const STRIP_PREFIXES: &[&str] = &["x-forwarded-", "x-user-", "x-gateway-", "x-internal-"];

/// Tower layer that sanitises request headers, records the client address and
/// adds security headers to responses.
#[derive(Clone, Default)]
pub struct SecurityLayer {
    trust_forwarded: bool,
}

impl SecurityLayer {
    /// With `trust_forwarded`, the first `X-Forwarded-For` hop is taken as the
    /// client address before the header is dropped.
    pub const fn new(trust_forwarded: bool) -> Self {
        Self { trust_forwarded }
    }
}

impl<S> Layer<S> for SecurityLayer {
    type Service = SecurityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityService {
            inner,
            trust_forwarded: self.trust_forwarded,
        }
    }
}

/// The service wrapper that performs header security.
#[derive(Clone)]
pub struct SecurityService<S> {
    inner: S,
    trust_forwarded: bool,
}

fn forwarded_client(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn strip_untrusted(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            STRIP_HEADERS.contains(&name) || STRIP_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .cloned()
        .collect();

    for name in doomed {
        headers.remove(name);
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SecurityService<S>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let forwarded = if self.trust_forwarded {
            forwarded_client(req.headers())
        } else {
            None
        };
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        if let Some(addr) = forwarded.or(peer) {
            req.extensions_mut().insert(ClientAddr(addr));
        }

        strip_untrusted(req.headers_mut());

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            // Backends may set stricter values; only fill in what is missing.
            let headers = response.headers_mut();
            headers
                .entry(STRICT_TRANSPORT_SECURITY)
                .or_insert(HeaderValue::from_static("max-age=31536000; includeSubDomains"));
            headers
                .entry(X_CONTENT_TYPE_OPTIONS)
                .or_insert(HeaderValue::from_static("nosniff"));
            headers
                .entry(X_FRAME_OPTIONS)
                .or_insert(HeaderValue::from_static("DENY"));

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::StatusCode;
    use tower::ServiceExt;

    async fn test_service(_req: Request<Body>) -> Result<Response<Body>, std::convert::Infallible> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap())
    }

    async fn report_client(req: Request<Body>) -> Result<Response<Body>, std::convert::Infallible> {
        let client = req
            .extensions()
            .get::<ClientAddr>()
            .map(|ClientAddr(addr)| addr.to_string())
            .unwrap_or_default();
        Ok(Response::new(Body::from(client)))
    }

    async fn body_text(response: Response<Body>) -> String {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn adds_security_headers() {
        let service = SecurityLayer::new(false).layer(tower::service_fn(test_service));

        let req = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = service.oneshot(req).await.unwrap();

        assert!(response.headers().contains_key(STRICT_TRANSPORT_SECURITY));
        assert!(response.headers().contains_key(X_CONTENT_TYPE_OPTIONS));
        assert!(response.headers().contains_key(X_FRAME_OPTIONS));
    }

    #[tokio::test]
    async fn keeps_backend_security_headers() {
        let service = SecurityLayer::new(false).layer(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .header(X_FRAME_OPTIONS, "SAMEORIGIN")
                    .body(Body::empty())
                    .unwrap(),
            )
        }));

        let req = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[X_FRAME_OPTIONS], "SAMEORIGIN");
    }

    #[tokio::test]
    async fn strips_identity_and_forwarding_headers() {
        let check_service = tower::service_fn(|req: Request<Body>| async move {
            for name in ["x-forwarded-for", "x-real-ip", "x-user-id", "x-user-role", "x-gateway-service"] {
                assert!(req.headers().get(name).is_none(), "{name} should be stripped");
            }
            assert!(req.headers().get("authorization").is_some());
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });

        let service = SecurityLayer::new(false).layer(check_service);

        let req = Request::builder()
            .uri("/test")
            .header("x-forwarded-for", "192.168.1.1")
            .header("x-real-ip", "10.0.0.1")
            .header("x-user-id", "admin")
            .header("x-user-role", "super_admin")
            .header("x-gateway-service", "payment")
            .header("authorization", "Bearer token")
            .body(Body::empty())
            .unwrap();

        service.oneshot(req).await.unwrap();
    }

    #[tokio::test]
    async fn client_address_from_peer() {
        let service = SecurityLayer::new(false).layer(tower::service_fn(report_client));

        let mut req = Request::builder()
            .uri("/test")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("203.0.113.5:41000".parse::<SocketAddr>().unwrap()));

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(body_text(response).await, "203.0.113.5");
    }

    #[tokio::test]
    async fn client_address_from_trusted_proxy() {
        let service = SecurityLayer::new(true).layer(tower::service_fn(report_client));

        let mut req = Request::builder()
            .uri("/test")
            .header("x-forwarded-for", "198.51.100.7, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("10.0.0.2:41000".parse::<SocketAddr>().unwrap()));

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(body_text(response).await, "198.51.100.7");
    }
}
