//! Listener: one bound port serving HTTP/1.1 and HTTP/2 through a router
//!
//! Each listener subscribes to its own `routes_{name}` topic and swaps its
//! router's table on every event. Shutdown stops accepting, then drains
//! in-flight connections through hyper's graceful shutdown; the app bounds
//! the drain with a timeout.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{route_topic, EventBus};
use crate::config::{Dynamic, ListenerConfig, TlsConfig};
use crate::plugin::Registry;
use crate::proxy::ReverseProxy;
use crate::router::HttpRouter;
use crate::task::spawn_guarded;
use crate::upstream::UpstreamFactory;

pub struct Listener {
    config: ListenerConfig,
    router: Arc<HttpRouter>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl Listener {
    /// Wire up a listener: build its router, load TLS material if
    /// configured, and subscribe to the listener's routes topic. TLS load
    /// failures are startup failures.
    pub fn new(
        config: ListenerConfig,
        bus: &Arc<EventBus<Dynamic>>,
        upstream_factory: Arc<UpstreamFactory>,
        registry: Arc<Registry>,
        proxy: Arc<ReverseProxy>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let router = Arc::new(HttpRouter::new(
            config.name.clone(),
            upstream_factory,
            registry,
            proxy,
        ));

        let tls_acceptor = match &config.tls {
            Some(tls) => Some(build_tls_acceptor(tls)?),
            None => None,
        };

        let mut subscription = bus.subscribe(&route_topic(&config.name));
        let subscriber_router = Arc::clone(&router);
        let listener_name = config.name.clone();
        spawn_guarded("listener", listener_name.clone(), async move {
            while let Some(doc) = subscription.recv().await {
                info!(listener = %listener_name, "Updating routes for listener");
                if let Err(err) = subscriber_router.update_routes(&doc) {
                    warn!(listener = %listener_name, error = %err, "Route update rejected");
                }
            }
        });

        Ok(Arc::new(Self {
            config,
            router,
            tls_acceptor,
            shutdown,
            connections: TaskTracker::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn router(&self) -> &Arc<HttpRouter> {
        &self.router
    }

    /// Accept loop. Returns after the shutdown token fires and every
    /// in-flight connection has drained.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let tcp = TcpListener::bind(addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "https" } else { "http" };
        info!(
            listener = %self.config.name,
            port = self.config.port,
            protocol,
            http2 = self.config.http2,
            "Listener started"
        );

        loop {
            tokio::select! {
                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let listener = Arc::clone(&self);
                            self.connections.spawn(async move {
                                listener.serve_connection(stream, peer).await;
                            });
                        }
                        Err(err) => {
                            error!(listener = %self.config.name, error = %err, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(listener = %self.config.name, "Listener shutting down");
                    break;
                }
            }
        }

        // Stop accepting, then drain. The caller bounds this wait.
        drop(tcp);
        self.connections.close();
        self.connections.wait().await;
        info!(listener = %self.config.name, "Listener stopped");
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        match self.tls_acceptor.clone() {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve_io(tls_stream, peer, true).await,
                Err(err) => {
                    debug!(listener = %self.config.name, peer = %peer, error = %err, "TLS handshake failed");
                }
            },
            None => self.serve_io(stream, peer, false).await,
        }
    }

    async fn serve_io<S>(self: Arc<Self>, stream: S, peer: SocketAddr, tls: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let router = Arc::clone(&self.router);
        let service = service_fn(move |req: Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.dispatch(req, peer, tls).await) }
        });

        // The auto builder speaks HTTP/1.1 (including upgrades) and HTTP/2 on
        // the same port; cleartext h2 arrives via the h2 preface, so an
        // `http2: true` listener without TLS still serves h2c. Header case is
        // preserved so relayed upgrade heads reach the client as sent.
        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        builder.http2().max_concurrent_streams(250);
        let conn = builder.serve_connection_with_upgrades(io, service);
        let mut conn = std::pin::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!(listener = %self.config.name, peer = %peer, error = %err, "Connection error");
                }
            }
            _ = self.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.as_mut().await;
            }
        }
    }
}

fn build_tls_acceptor(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert_file)?;
    let key = load_key(&tls.key_file)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
