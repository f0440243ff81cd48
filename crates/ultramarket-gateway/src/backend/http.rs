//! HTTP/1.1 transport to backend services.

use async_trait::async_trait;
use axum::body::Body;
use hyper::body::{Body as HttpBody, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Sleep;

use super::{Backend, BackendFailure};
use crate::config::{parse_backend_url, ConfigError};
use crate::context::Deadline;

/// Streams requests to one backend over a fresh HTTP/1.1 connection each time.
#[derive(Debug)]
#[must_use]
pub struct HttpBackend {
    authority: String,
    host_header: HeaderValue,
    base_path: String,
    connect_timeout: Duration,
}

impl HttpBackend {
    /// Creates a backend from an `http://host[:port][/base]` URL.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let (host, port, base_path) = parse_backend_url(url)
            .map_err(|reason| ConfigError::Invalid(format!("backend url '{url}': {reason}")))?;

        let authority = format!("{host}:{port}");
        let host_header = HeaderValue::from_str(&authority)
            .map_err(|e| ConfigError::Invalid(format!("backend url '{url}': {e}")))?;

        Ok(Self {
            authority,
            host_header,
            base_path,
            connect_timeout: Duration::from_secs(5),
        })
    }

    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, BackendFailure> {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("{}{path_and_query}", self.base_path)
            .parse()
            .map_err(|e| BackendFailure::Protocol(format!("invalid upstream uri: {e}")))
    }

    async fn connect(&self, deadline: Deadline) -> Result<TcpStream, BackendFailure> {
        let budget = self.connect_timeout.min(deadline.remaining());

        match tokio::time::timeout(budget, TcpStream::connect(&self.authority)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(BackendFailure::Connect(e.to_string())),
            Err(_) if deadline.is_expired() => Err(BackendFailure::Timeout),
            Err(_) => Err(BackendFailure::ConnectTimeout),
        }
    }
}

/// The response body outlived the route deadline.
#[derive(Debug, thiserror::Error)]
#[error("backend response body exceeded the route deadline")]
pub struct BodyDeadlineExceeded;

/// Backend response body that fails once the route deadline passes.
///
/// Failing the body drops the upstream `Incoming`, which closes the backend
/// connection, and aborts the client response mid-stream.
struct DeadlineBody {
    inner: Incoming,
    sleep: Pin<Box<Sleep>>,
    authority: String,
    expired: bool,
}

impl DeadlineBody {
    fn new(inner: Incoming, deadline: Deadline, authority: String) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline.instant())),
            authority,
            expired: false,
        }
    }
}

impl HttpBody for DeadlineBody {
    type Data = Bytes;
    type Error = axum::BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|frame| frame.map_err(Into::into)));
        }

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.expired = true;
            tracing::warn!(backend = %this.authority, "backend response body stalled past the route deadline");
            return Poll::Ready(Some(Err(BodyDeadlineExceeded.into())));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(
        &self,
        req: Request<Body>,
        deadline: Deadline,
    ) -> Result<Response<Body>, BackendFailure> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.headers.insert(HOST, self.host_header.clone());
        let request = Request::from_parts(parts, body);

        let stream = self.connect(deadline).await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = tokio::time::timeout_at(deadline.instant(), http1::handshake(io))
            .await
            .map_err(|_| BackendFailure::Timeout)?
            .map_err(|e| BackendFailure::Protocol(e.to_string()))?;

        // Spawn connection driver
        let authority = self.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(backend = %authority, error = %e, "backend connection closed with error");
            }
        });

        let response = tokio::time::timeout_at(deadline.instant(), sender.send_request(request))
            .await
            .map_err(|_| BackendFailure::Timeout)?
            .map_err(|e| BackendFailure::Protocol(e.to_string()))?;

        let authority = self.authority.clone();
        Ok(response.map(|body| Body::new(DeadlineBody::new(body, deadline, authority))))
    }

    async fn probe(&self, path: &str, timeout: Duration) -> Result<StatusCode, BackendFailure> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .map_err(|e| BackendFailure::Protocol(e.to_string()))?;

        let response = self.send(request, Deadline::after(timeout)).await?;
        Ok(response.status())
    }
}
