//! Main proxy server: dual dispatch between CONNECT tunnels and
//! absolute-URI HTTP requests.

use bytes::BytesMut;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::rewind::Rewind;
use super::{connect, request};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// The main proxy server. `bind()` initialises the engine and both
/// listeners (port 0 is honoured, for tests); `serve()` accepts until
/// shutdown.
pub struct ProxyServer {
    config: Config,
    upstream_tls_override: Option<Arc<ClientConfig>>,
    engine: Option<Arc<Engine>>,
    listener: Option<TcpListener>,
    sni_listener: Option<TcpListener>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            upstream_tls_override: None,
            engine: None,
            listener: None,
            sni_listener: None,
        }
    }

    /// Inject a custom TLS config for upstream connections (for testing
    /// with self-signed certs).
    pub fn with_upstream_tls(mut self, tls: Arc<ClientConfig>) -> Self {
        self.upstream_tls_override = Some(tls);
        self
    }

    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    /// The engine, available once `bind()` has run.
    pub fn engine(&self) -> &Arc<Engine> {
        self.engine.as_ref().expect("must call bind() before engine()")
    }

    /// Initialise certificates, bind both listeners, and return their
    /// actual addresses.
    pub async fn bind(&mut self) -> Result<(SocketAddr, SocketAddr)> {
        let engine = Engine::init(self.config.clone(), self.upstream_tls_override.clone()).await?;

        let addr: SocketAddr = self.config.proxy.bind_address.parse().map_err(|e| {
            Error::config(format!(
                "Invalid bind address '{}': {}",
                self.config.proxy.bind_address, e
            ))
        })?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let sni_addr: SocketAddr = self.config.proxy.tls_bind_address.parse().map_err(|e| {
            Error::config(format!(
                "Invalid TLS bind address '{}': {}",
                self.config.proxy.tls_bind_address, e
            ))
        })?;
        let sni_listener = TcpListener::bind(sni_addr).await?;
        let sni_local_addr = sni_listener.local_addr()?;
        engine.sni().set_local_port(sni_local_addr.port());

        self.engine = Some(engine);
        self.listener = Some(listener);
        self.sni_listener = Some(sni_listener);
        Ok((local_addr, sni_local_addr))
    }

    /// Accept connections until the shutdown signal fires. Must be
    /// preceded by `bind()`.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let engine = self.engine.take().expect("must call bind() before serve()");
        let listener = self.listener.take().expect("must call bind() before serve()");
        let sni_listener = self
            .sni_listener
            .take()
            .expect("must call bind() before serve()");

        let sni_task = tokio::spawn(engine.sni().clone().run(engine.clone(), sni_listener));

        let tls_acceptor = if self.config.proxy.use_tls {
            Some(TlsAcceptor::from(Arc::new(
                engine.store().self_server_config()?,
            )))
        } else {
            None
        };

        tracing::info!(address = %self.config.proxy.bind_address, "Proxy server listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    sni_task.abort();
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");

                    let engine = engine.clone();
                    let tls_acceptor = tls_acceptor.clone();

                    tokio::spawn(async move {
                        match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => dispatch_connection(engine, tls).await,
                                Err(e) => {
                                    tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
                                }
                            },
                            None => dispatch_connection(engine, stream).await,
                        }
                    });
                }
            }
        }
    }

    /// Bind (if not already bound) and serve until shutdown.
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        if self.engine.is_none() {
            self.bind().await?;
        }
        self.serve(shutdown).await
    }
}

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Decide whether a fresh connection starts with a CONNECT request and
/// route it accordingly. Bytes consumed while deciding are replayed to
/// whichever engine takes over.
async fn dispatch_connection<S>(engine: Arc<Engine>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(1024);
    let is_connect = loop {
        let have = buf.len().min(CONNECT_PREFIX.len());
        if buf[..have] != CONNECT_PREFIX[..have] {
            break false;
        }
        if buf.len() >= CONNECT_PREFIX.len() {
            break true;
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) => break false,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Client read failed");
                return;
            }
        }
    };

    if is_connect {
        if let Err(e) = connect::handle(engine, stream, buf).await {
            if e.is_fatal() {
                crate::error::fatal(&e);
            }
            match e {
                Error::MalformedRequest(_) | Error::Denied => {
                    tracing::debug!(error = %e, "Tunnel closed");
                }
                _ => tracing::warn!(error = %e, "Tunnel failed"),
            }
        }
        return;
    }

    serve_http(engine, Rewind::new(buf.freeze(), stream)).await;
}

/// Serve forward-proxy HTTP on a connection. Transactions that fail
/// tear the connection down without an answer; hyper drops the socket
/// when the service errors.
async fn serve_http<S>(engine: Arc<Engine>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { request::handle_forward(engine, req).await }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        let err_str = e.to_string();
        if !err_str.contains("connection closed") && !err_str.contains("early eof") {
            tracing::debug!(error = %e, "Connection ended");
        }
    }
}
