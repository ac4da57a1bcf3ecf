//! Reverse-proxy transport: a hand-rolled HTTP/1.1 round trip over pooled
//! TCP connections
//!
//! The transport serializes the (rewritten) inbound request onto an upstream
//! connection, parses the response head itself, and copies the body into the
//! response sink. `101 Switching Protocols` answers hijack the client byte
//! stream and bridge the two connections until either side closes; those
//! connections are never returned to the pool.

use std::collections::{HashMap, VecDeque};
use std::io;

use bytes::{Bytes, BytesMut};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::error::{write_error, ProxyErrorCode};
use crate::sink::ResponseSink;
use crate::upstream::Node;

/// Copy buffer for streaming bodies; also the coalescing threshold for
/// buffered copies.
const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on a response head before we give up on parsing it.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const STREAMING_CONTENT_TYPES: &[&str] = &["text/event-stream", "application/stream+json"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// WebSocket upgrade: `Upgrade: websocket` plus a `Connection` header
/// containing `upgrade`, both case-insensitive.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Configuration for the per-target connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept per target host.
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
        }
    }
}

/// FIFO of reusable TCP connections, keyed by `host:port` target. Ownership
/// of a connection transfers to the caller on `get` and returns on `put`.
pub struct ConnPool {
    config: PoolConfig,
    idle: Mutex<HashMap<String, VecDeque<TcpStream>>>,
}

impl ConnPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Pop a pooled connection for `authority` or dial a new one.
    pub async fn get(&self, authority: &str) -> io::Result<TcpStream> {
        let pooled = self
            .idle
            .lock()
            .get_mut(authority)
            .and_then(|queue| queue.pop_front());
        match pooled {
            Some(conn) => {
                debug!(authority, "Reusing pooled upstream connection");
                Ok(conn)
            }
            None => TcpStream::connect(authority).await,
        }
    }

    pub fn put(&self, authority: &str, conn: TcpStream) {
        let mut idle = self.idle.lock();
        let queue = idle.entry(authority.to_string()).or_default();
        if queue.len() < self.config.max_idle_per_host {
            queue.push_back(conn);
        }
    }

    pub fn idle_count(&self, authority: &str) -> usize {
        self.idle.lock().get(authority).map(|q| q.len()).unwrap_or(0)
    }
}

/// Parsed upstream response head, with header names and order preserved as
/// received.
#[derive(Debug)]
pub struct RawResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl RawResponseHead {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .map(|v| v.to_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn connection_close(&self) -> bool {
        self.get("connection")
            .map(|v| v.to_lowercase().contains("close"))
            .unwrap_or(false)
    }

    /// A streaming response is copied with a small buffer and flushed after
    /// every chunk instead of being coalesced.
    pub fn is_streaming(&self) -> bool {
        if self.is_chunked() {
            return true;
        }
        self.get("content-type")
            .map(|ct| STREAMING_CONTENT_TYPES.iter().any(|s| ct.contains(s)))
            .unwrap_or(false)
    }

    pub fn framing(&self) -> BodyFraming {
        if self.is_chunked() {
            BodyFraming::Chunked
        } else if let Some(len) = self.content_length() {
            BodyFraming::Length(len)
        } else {
            BodyFraming::UntilClose
        }
    }
}

fn parse_response_head(raw: &[u8]) -> io::Result<RawResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty response head"))?;
    let mut pieces = status_line.splitn(3, ' ');
    let version = pieces.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed status line: {status_line}"),
        ));
    }
    let status: u16 = pieces
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {status_line}"),
            )
        })?;
    let reason = pieces.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RawResponseHead {
        status,
        reason,
        headers,
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Buffered reader over an upstream connection. Bytes read past the response
/// head stay in the buffer and are consumed by the body reader (or forwarded
/// verbatim on an upgrade bridge).
pub struct UpstreamConn<S = TcpStream> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> UpstreamConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buf)
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.stream.read_buf(&mut self.buf).await
    }

    /// Read and parse the status line and header block.
    pub async fn read_head(&mut self) -> io::Result<RawResponseHead> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n\r\n") {
                let head = self.buf.split_to(pos + 4);
                return parse_response_head(&head);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response head too large",
                ));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                ));
            }
        }
    }

    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid line",
                ));
            }
        }
    }

    /// Take up to `limit` buffered bytes, reading from the socket when the
    /// buffer is empty. `None` means clean end of stream.
    async fn take_up_to(&mut self, limit: usize) -> io::Result<Option<Bytes>> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        let n = limit.min(self.buf.len());
        Ok(Some(self.buf.split_to(n).freeze()))
    }
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    UntilClose,
}

enum ReadState {
    Length(u64),
    Eof,
    ChunkSize,
    ChunkData(u64),
    Trailers,
    Done,
}

/// Decodes the upstream body framing into plain byte chunks.
pub struct BodyReader<'a, S> {
    conn: &'a mut UpstreamConn<S>,
    state: ReadState,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> BodyReader<'a, S> {
    pub fn new(conn: &'a mut UpstreamConn<S>, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Length(0) => ReadState::Done,
            BodyFraming::Length(n) => ReadState::Length(n),
            BodyFraming::Chunked => ReadState::ChunkSize,
            BodyFraming::UntilClose => ReadState::Eof,
        };
        Self { conn, state }
    }

    /// Whether the body ended exactly where its framing said it would. Only
    /// then is the connection safe to reuse.
    pub fn finished_cleanly(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.state {
                ReadState::Done => return Ok(None),
                ReadState::Length(remaining) => {
                    let limit = (remaining as usize).min(STREAM_BUFFER_SIZE);
                    match self.conn.take_up_to(limit).await? {
                        Some(chunk) => {
                            let left = remaining - chunk.len() as u64;
                            self.state = if left == 0 {
                                ReadState::Done
                            } else {
                                ReadState::Length(left)
                            };
                            return Ok(Some(chunk));
                        }
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid body",
                            ))
                        }
                    }
                }
                ReadState::Eof => match self.conn.take_up_to(STREAM_BUFFER_SIZE).await? {
                    Some(chunk) => return Ok(Some(chunk)),
                    // Close-delimited bodies end at EOF by definition, but
                    // the connection is spent and stays out of the pool.
                    None => return Ok(None),
                },
                ReadState::ChunkSize => {
                    let line = self.conn.read_line().await?;
                    let size_str = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("malformed chunk size: {line}"),
                        )
                    })?;
                    self.state = if size == 0 {
                        ReadState::Trailers
                    } else {
                        ReadState::ChunkData(size)
                    };
                }
                ReadState::ChunkData(0) => {
                    // Chunk terminator.
                    self.conn.read_line().await?;
                    self.state = ReadState::ChunkSize;
                }
                ReadState::ChunkData(remaining) => {
                    let limit = (remaining as usize).min(STREAM_BUFFER_SIZE);
                    match self.conn.take_up_to(limit).await? {
                        Some(chunk) => {
                            self.state = ReadState::ChunkData(remaining - chunk.len() as u64);
                            return Ok(Some(chunk));
                        }
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid chunk",
                            ))
                        }
                    }
                }
                ReadState::Trailers => {
                    let line = self.conn.read_line().await?;
                    if line.is_empty() {
                        self.state = ReadState::Done;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Serialize the forwarded request onto the upstream connection. Hop-by-hop
/// headers are already gone for non-upgrade traffic; the Host header is
/// rewritten to the target. Bodies keep their Content-Length framing when
/// they have one and are chunk-encoded otherwise.
pub async fn write_request<S, B>(
    conn: &mut S,
    parts: &Parts,
    headers: &HeaderMap,
    body: B,
    authority: &str,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    use http_body_util::BodyExt;

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, path).as_bytes());
    head.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    for (name, value) in headers {
        if name == &hyper::header::HOST {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    let mut body = body;
    if headers.contains_key(hyper::header::CONTENT_LENGTH) {
        head.extend_from_slice(b"\r\n");
        conn.write_all(&head).await?;
        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                conn.write_all(&data).await?;
            }
        }
    } else {
        // Peek for a body before committing to a framing: bodyless requests
        // go out with neither Content-Length nor Transfer-Encoding.
        let mut first_data: Option<Bytes> = None;
        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    first_data = Some(data);
                    break;
                }
            }
        }
        match first_data {
            None => {
                head.extend_from_slice(b"\r\n");
                conn.write_all(&head).await?;
            }
            Some(first) => {
                head.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
                conn.write_all(&head).await?;
                write_chunk(conn, &first).await?;
                while let Some(frame) = body.frame().await {
                    let frame = frame
                        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
                    if let Ok(data) = frame.into_data() {
                        if !data.is_empty() {
                            write_chunk(conn, &data).await?;
                        }
                    }
                }
                conn.write_all(b"0\r\n\r\n").await?;
            }
        }
    }
    conn.flush().await
}

async fn write_chunk<S: AsyncWrite + Unpin>(conn: &mut S, data: &[u8]) -> io::Result<()> {
    conn.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    conn.write_all(data).await?;
    conn.write_all(b"\r\n").await
}

/// The transport itself: one instance serves every route, holding the shared
/// connection pool.
pub struct ReverseProxy {
    pool: ConnPool,
}

impl ReverseProxy {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pool: ConnPool::new(config),
        }
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    /// Forward the request to `node` and write the response into `sink`.
    /// Every failure path writes a status; this function never panics the
    /// request task.
    pub async fn serve<B>(&self, parts: Parts, body: B, sink: &mut dyn ResponseSink, node: &Node)
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let Some(authority) = node.authority() else {
            error!(url = %node.url, "Upstream node URL has no usable host/port");
            write_error(sink, ProxyErrorCode::BadGateway, "Bad Gateway").await;
            return;
        };

        let upgrade = is_websocket_upgrade(&parts.headers);
        let mut headers = parts.headers.clone();
        if !upgrade {
            remove_hop_headers(&mut headers);
        }

        let conn = match self.pool.get(&authority).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(authority = %authority, error = %err, "Failed to connect to upstream");
                write_error(sink, ProxyErrorCode::BadGateway, "Bad Gateway").await;
                return;
            }
        };
        let mut upstream = UpstreamConn::new(conn);

        if let Err(err) =
            write_request(upstream.stream_mut(), &parts, &headers, body, &authority).await
        {
            error!(authority = %authority, error = %err, "Failed to write request to upstream");
            write_error(sink, ProxyErrorCode::BadGateway, "Bad Gateway").await;
            return;
        }

        let head = match upstream.read_head().await {
            Ok(head) => head,
            Err(err) => {
                error!(authority = %authority, error = %err, "Failed to read upstream response");
                write_error(sink, ProxyErrorCode::BadGateway, "Bad Gateway").await;
                return;
            }
        };

        if head.status == StatusCode::SWITCHING_PROTOCOLS.as_u16() && upgrade {
            // Long-lived connection: consumed by the bridge, never pooled.
            self.bridge_upgrade(sink, upstream, head).await;
            return;
        }

        for (name, value) in &head.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                sink.headers_mut().append(name, value);
            }
        }
        let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);
        sink.write_header(status).await;

        let framing = if parts.method == Method::HEAD || head.status == 204 || head.status == 304 {
            BodyFraming::Length(0)
        } else {
            head.framing()
        };
        let streaming = head.is_streaming();
        let mut reader = BodyReader::new(&mut upstream, framing);
        let copied = if streaming {
            copy_and_flush(&mut reader, sink).await
        } else {
            copy_buffered(&mut reader, sink).await
        };

        match copied {
            Ok(()) => {
                let reusable = reader.finished_cleanly()
                    && framing != BodyFraming::UntilClose
                    && !head.connection_close();
                drop(reader);
                if reusable {
                    self.pool.put(&authority, upstream.into_parts().0);
                }
            }
            Err(err) => {
                info!(authority = %authority, error = %err, "Copy error");
            }
        }
    }

    /// Relay the upstream 101 head to the client, take over the client byte
    /// stream, and shuttle bytes both ways until one side closes.
    async fn bridge_upgrade<S>(
        &self,
        sink: &mut dyn ResponseSink,
        upstream: UpstreamConn<S>,
        head: RawResponseHead,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let on_upgrade = match sink.hijack() {
            Ok(on_upgrade) => on_upgrade,
            Err(_) => {
                error!("Hijacking not supported");
                write_error(sink, ProxyErrorCode::HijackUnsupported, "Hijacking not supported")
                    .await;
                return;
            }
        };

        for (name, value) in &head.headers {
            // Framing headers are meaningless on a 101 and confuse hyper.
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                sink.headers_mut().append(name, value);
            }
        }
        sink.write_header(StatusCode::SWITCHING_PROTOCOLS).await;

        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                error!(error = %err, "Client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        let (mut upstream_stream, leftover) = upstream.into_parts();

        if !leftover.is_empty() {
            if let Err(err) = client.write_all(&leftover).await {
                debug!(error = %err, "Upgrade bridge closed before first write");
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut client, &mut upstream_stream).await {
            Ok((to_upstream, to_client)) => {
                debug!(to_upstream, to_client, "Upgrade bridge closed");
            }
            Err(err) => {
                debug!(error = %err, "Upgrade bridge closed with error");
            }
        }
    }
}

async fn copy_and_flush<S>(
    reader: &mut BodyReader<'_, S>,
    sink: &mut dyn ResponseSink,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Every chunk goes out as its own frame, so consumers see bytes as soon
    // as the upstream produces them.
    while let Some(chunk) = reader.next_chunk().await? {
        sink.write(&chunk).await?;
    }
    Ok(())
}

async fn copy_buffered<S>(
    reader: &mut BodyReader<'_, S>,
    sink: &mut dyn ResponseSink,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = BytesMut::with_capacity(STREAM_BUFFER_SIZE);
    while let Some(chunk) = reader.next_chunk().await? {
        pending.extend_from_slice(&chunk);
        if pending.len() >= STREAM_BUFFER_SIZE {
            sink.write(&pending.split().freeze()).await?;
        }
    }
    if !pending.is_empty() {
        sink.write(&pending.freeze()).await?;
    }
    Ok(())
}
