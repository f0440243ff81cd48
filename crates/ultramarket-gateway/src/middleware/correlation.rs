//! Correlation id propagation and the per-request tracing span.

use http::{Request, Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::context::{CorrelationId, CORRELATION_ID_HEADER};

/// Resolves the request's correlation id, records it in the extensions and
/// request headers, and echoes it on every response.
#[derive(Clone, Default)]
pub struct CorrelationLayer;

impl CorrelationLayer {
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService { inner }
    }
}

#[derive(Clone)]
pub struct CorrelationService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CorrelationService<S>
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
        let correlation_id = CorrelationId::resolve(req.headers());
        let header_value = correlation_id.header_value();

        match &header_value {
            Some(value) => {
                req.headers_mut()
                    .insert(CORRELATION_ID_HEADER, value.clone());
            }
            None => {
                req.headers_mut().remove(CORRELATION_ID_HEADER);
            }
        }

        let span = tracing::info_span!(
            "http.request",
            correlation_id = %correlation_id,
            method = %req.method(),
            path = %req.uri().path(),
            status = tracing::field::Empty,
        );

        req.extensions_mut().insert(correlation_id);
        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;

                tracing::Span::current().record("status", response.status().as_u16());
                if let Some(value) = header_value {
                    response
                        .headers_mut()
                        .insert(CORRELATION_ID_HEADER, value);
                }

                Ok(response)
            }
            .instrument(span),
        )
    }
}
