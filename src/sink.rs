//! Response sink: the write side of a proxied response
//!
//! Plugins and the transport never touch hyper's response types directly.
//! They write into a `ResponseSink`: headers first, then a status, then body
//! bytes. The base `ServerSink` feeds a channel-backed response body, so the
//! head can be handed to the HTTP server while the body is still being
//! copied. Plugin wrappers delegate to an inner boxed sink and intercept
//! whichever calls they care about.

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::header::HeaderMap;
use hyper::upgrade::OnUpgrade;
use hyper::{Response, StatusCode};
use tokio::sync::{mpsc, oneshot};

/// Body type used for every response this proxy produces.
pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// Capacity of the body-frame channel between the pipeline and the server.
const BODY_CHANNEL_CAPACITY: usize = 32;

/// The response head, sent once per response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Error returned when a sink cannot hand over its underlying byte stream.
#[derive(Debug)]
pub struct HijackError;

impl std::fmt::Display for HijackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection does not support hijacking")
    }
}

impl std::error::Error for HijackError {}

/// Write side of a response. All writes are in terms of the client-visible
/// response; wrappers added by plugins form concentric layers around the
/// base sink.
#[async_trait]
pub trait ResponseSink: Send {
    /// Headers to be sent with the response head. Mutations after the head
    /// has been written have no effect.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the response head. The first call wins; later calls are ignored.
    async fn write_header(&mut self, status: StatusCode);

    /// Append body bytes, implicitly sending a 200 head if none was written.
    /// Returns `BrokenPipe` once the client has gone away.
    async fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Take ownership of the client byte stream for a protocol upgrade.
    /// Fails when the underlying connection cannot be upgraded.
    fn hijack(&mut self) -> Result<OnUpgrade, HijackError>;
}

/// Base sink: bridges the pipeline to the hyper response returned by the
/// listener's service function.
pub struct ServerSink {
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<Bytes>,
    on_upgrade: Option<OnUpgrade>,
}

impl ServerSink {
    /// Create a sink plus the receiving halves the dispatcher turns into a
    /// `Response`. `on_upgrade` is present only for upgrade-capable requests.
    pub fn channel(
        on_upgrade: Option<OnUpgrade>,
    ) -> (Self, oneshot::Receiver<ResponseHead>, mpsc::Receiver<Bytes>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let sink = Self {
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx,
            on_upgrade,
        };
        (sink, head_rx, body_rx)
    }
}

#[async_trait]
impl ResponseSink for ServerSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_header(&mut self, status: StatusCode) {
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(ResponseHead {
                status,
                headers: std::mem::take(&mut self.headers),
            });
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.head_tx.is_some() {
            self.write_header(StatusCode::OK).await;
        }
        self.body_tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client closed response body"))?;
        Ok(data.len())
    }

    fn hijack(&mut self) -> Result<OnUpgrade, HijackError> {
        self.on_upgrade.take().ok_or(HijackError)
    }
}

/// Response body streamed out of the pipeline's frame channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Assemble the hyper response for a head produced by the pipeline.
pub fn response_from_head(head: ResponseHead, body_rx: mpsc::Receiver<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(ChannelBody::new(body_rx).boxed());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_header_sends_head_once() {
        let (mut sink, head_rx, _body_rx) = ServerSink::channel(None);
        sink.headers_mut()
            .insert("x-test", "yes".parse().unwrap());
        sink.write_header(StatusCode::CREATED).await;
        sink.write_header(StatusCode::INTERNAL_SERVER_ERROR).await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.headers.get("x-test").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_write_implies_ok_head() {
        let (mut sink, head_rx, mut body_rx) = ServerSink::channel(None);
        sink.write(b"hello").await.unwrap();
        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_write_after_client_gone_is_broken_pipe() {
        let (mut sink, _head_rx, body_rx) = ServerSink::channel(None);
        drop(body_rx);
        sink.write_header(StatusCode::OK).await;
        let err = sink.write(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_hijack_without_upgrade_fails() {
        let (mut sink, _head_rx, _body_rx) = ServerSink::channel(None);
        assert!(sink.hijack().is_err());
    }
}
