//! Shared helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::HeaderMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use violentproxy::cert::{CA_CERT_FILE, CA_PRIVATE_FILE, CA_PUBLIC_FILE};
use violentproxy::patch::{
    ConnectDecision, ConnectPatcher, PatchContext, RequestDecision, RequestPatcher, TextPatcher,
};
use violentproxy::{CaMaterial, Config, Engine, ProxyServer};

pub fn init_crypto() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a raw HTTP/1.1 response with a computed `Content-Length`.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A canned-response HTTP upstream that serves keep-alive connections
/// and counts both accepted connections and served requests.
pub struct TestUpstream {
    addr: SocketAddr,
    pub accepts: Arc<AtomicUsize>,
    pub hits: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

async fn serve_canned<S>(mut stream: S, response: Arc<Vec<u8>>, hits: Arc<AtomicUsize>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(idx) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            pending.drain(..idx + 4);
            hits.fetch_add(1, Ordering::SeqCst);
            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

impl TestUpstream {
    pub async fn start(response: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let response = Arc::new(response);

        let accepts_task = accepts.clone();
        let hits_task = hits.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                accepts_task.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_canned(stream, response.clone(), hits_task.clone()));
            }
        });

        Self {
            addr,
            accepts,
            hits,
            handle,
        }
    }

    /// TLS variant serving the supplied server identity.
    pub async fn start_tls(config: Arc<rustls::ServerConfig>, response: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let response = Arc::new(response);
        let acceptor = TlsAcceptor::from(config);

        let accepts_task = accepts.clone();
        let hits_task = hits.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                accepts_task.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let response = response.clone();
                let hits = hits_task.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        serve_canned(tls, response, hits).await;
                    }
                });
            }
        });

        Self {
            addr,
            accepts,
            hits,
            handle,
        }
    }

    /// Raw TCP echo, for pipe-mode tunnels.
    pub async fn start_echo() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let accepts_task = accepts.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                accepts_task.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepts,
            hits,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Pre-generate CA material into a certificate directory so tests can
/// issue upstream certificates from the same root the proxy will load.
pub fn plant_ca(dir: &Path) -> CaMaterial {
    let ca = CaMaterial::generate(&["localhost".to_string()], &["127.0.0.1".to_string()]).unwrap();
    std::fs::write(dir.join(CA_PRIVATE_FILE), &ca.key_pem).unwrap();
    std::fs::write(dir.join(CA_PUBLIC_FILE), &ca.public_pem).unwrap();
    std::fs::write(dir.join(CA_CERT_FILE), &ca.cert_pem).unwrap();
    ca
}

/// A proxy bound to ephemeral ports with its own certificate
/// directory.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub engine: Arc<Engine>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
    _cert_dir: tempfile::TempDir,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with(tempfile::tempdir().unwrap(), None).await
    }

    pub async fn start_with(
        cert_dir: tempfile::TempDir,
        upstream_override_port: Option<u16>,
    ) -> Self {
        init_crypto();

        let mut config = Config::parse("").unwrap();
        config.proxy.bind_address = "127.0.0.1:0".to_string();
        config.proxy.tls_bind_address = "127.0.0.1:0".to_string();
        config.proxy.cert_dir = cert_dir.path().to_string_lossy().to_string();
        config.proxy.upstream_override_port = upstream_override_port;

        let mut server = ProxyServer::new(config);
        let (addr, tls_addr) = server.bind().await.unwrap();
        let engine = server.engine().clone();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            server.serve(shutdown_rx).await.unwrap();
        });

        Self {
            addr,
            tls_addr,
            engine,
            shutdown: Some(shutdown_tx),
            handle,
            _cert_dir: cert_dir,
        }
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// Write a raw request and collect everything until the proxy closes
/// the connection.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}

/// Split a raw HTTP response into head text and body bytes.
pub fn response_parts(raw: &[u8]) -> (String, Vec<u8>) {
    let idx = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head")
        + 4;
    (
        String::from_utf8_lossy(&raw[..idx]).into_owned(),
        raw[idx..].to_vec(),
    )
}

/// Look a header up in a response head, case-insensitively.
pub fn header_value(head: &str, name: &str) -> Option<String> {
    for line in head.split("\r\n").skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Read from a stream until the end of an HTTP head.
pub async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while !out.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&byte);
    }
    out
}

/// Read one full response (head plus `Content-Length` body) from a
/// keep-alive connection.
pub async fn read_one_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let head_bytes = read_head(stream).await;
    let head = String::from_utf8_lossy(&head_bytes).into_owned();
    let length: usize = header_value(&head, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Connect patcher that always answers with one decision.
pub struct FixedConnectPatcher(pub ConnectDecision);

#[async_trait]
impl ConnectPatcher for FixedConnectPatcher {
    async fn on_connect(&self, _target: &str, _request_id: u64) -> ConnectDecision {
        self.0
    }
}

/// Request patcher that always answers with one decision.
pub struct FixedRequestPatcher(pub RequestDecision);

#[async_trait]
impl RequestPatcher for FixedRequestPatcher {
    async fn on_request(
        &self,
        _ctx: &PatchContext,
        _headers: &mut HeaderMap,
        body: Bytes,
    ) -> (RequestDecision, Bytes) {
        (self.0.clone(), body)
    }
}

/// Text patcher that records the URLs it is shown and leaves the text
/// untouched.
pub struct RecordingTextPatcher {
    pub seen_urls: Arc<std::sync::Mutex<Vec<String>>>,
}

impl RecordingTextPatcher {
    pub fn new() -> Self {
        Self {
            seen_urls: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TextPatcher for RecordingTextPatcher {
    async fn on_text_response(
        &self,
        ctx: &PatchContext,
        _headers: &mut HeaderMap,
        text: String,
    ) -> String {
        self.seen_urls.lock().unwrap().push(ctx.url.clone());
        text
    }
}
