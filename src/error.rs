//! Data-plane error codes and their HTTP responses

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::sink::{ProxyBody, ResponseSink};

/// Failure classes the request path distinguishes. Every one of these ends in
/// a written status; the request path itself never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No route matched the request's path, method, and headers.
    RouteNotFound,
    /// A plugin's request phase returned an error.
    PluginFailed,
    /// The matched route's upstream has no selectable node.
    NoAvailableUpstream,
    /// Dial, write, read, or parse failure against the upstream.
    BadGateway,
    /// Protocol upgrade requested on a connection that cannot be hijacked.
    HijackUnsupported,
    /// Anything else that escaped the pipeline.
    Internal,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::PluginFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NoAvailableUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::HijackUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the `X-Proxy-Error` diagnostic header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::PluginFailed => "PLUGIN_FAILED",
            ProxyErrorCode::NoAvailableUpstream => "NO_AVAILABLE_UPSTREAM",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::HijackUnsupported => "HIJACK_UNSUPPORTED",
            ProxyErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Build a complete error response, for failures detected before a response
/// sink exists.
pub fn error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("static error response headers are valid")
}

/// Write an error through a response sink. If a head has already been sent
/// this degrades to appending the message to the body, the same way writing
/// an error to a half-sent response does anywhere else.
pub async fn write_error(sink: &mut dyn ResponseSink, code: ProxyErrorCode, message: &str) {
    if let Ok(value) = code.as_header_value().parse() {
        sink.headers_mut().insert("X-Proxy-Error", value);
    }
    if let Ok(value) = "text/plain; charset=utf-8".parse() {
        sink.headers_mut().insert("Content-Type", value);
    }
    sink.write_header(code.status_code()).await;
    let _ = sink.write(format!("{message}\n").as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ServerSink;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyErrorCode::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::PluginFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::NoAvailableUpstream.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyErrorCode::HijackUnsupported.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(ProxyErrorCode::RouteNotFound, "404 page not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "ROUTE_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_write_error_through_sink() {
        let (mut sink, head_rx, mut body_rx) = ServerSink::channel(None);
        write_error(&mut sink, ProxyErrorCode::BadGateway, "Bad Gateway").await;

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::BAD_GATEWAY);
        assert_eq!(head.headers.get("X-Proxy-Error").unwrap(), "BAD_GATEWAY");
        let body = body_rx.recv().await.unwrap();
        assert_eq!(&body[..], b"Bad Gateway\n");
    }
}
