//! Dynamic SNI-multiplexed TLS server
//!
//! One TLS listener serves every intercepted tunnel. Certificates are
//! installed per host on first use and resolved from the client's SNI
//! at handshake time, so new hosts are served without a restart.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::request;
use crate::cert::{cache_key, CertStore};
use crate::engine::Engine;
use crate::error::Result;

/// Resolves server identities from the SNI in the client hello. Keys
/// are stored in wildcard form, so one entry covers every host that
/// shares a cache key.
struct SniCertResolver {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.certs.read().map(|certs| certs.len()).unwrap_or(0);
        f.debug_struct("SniCertResolver")
            .field("contexts", &count)
            .finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let certs = self.certs.read().unwrap();
        certs
            .get(name)
            .cloned()
            .or_else(|| certs.get(&cache_key(name)).cloned())
    }
}

/// The interception listener: terminates TLS with on-demand leaves and
/// re-enters the request engine with `https://host/…` synthesised.
pub struct SniServer {
    store: Arc<CertStore>,
    resolver: Arc<SniCertResolver>,
    known_hosts: Mutex<HashSet<String>>,
    port: AtomicU16,
}

impl SniServer {
    pub fn new(store: Arc<CertStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver: Arc::new(SniCertResolver {
                certs: RwLock::new(HashMap::new()),
            }),
            known_hosts: Mutex::new(HashSet::new()),
            port: AtomicU16::new(0),
        })
    }

    /// Ensure an SNI context for `host` is installed.
    ///
    /// Resolves on a later scheduler tick even when the host is already
    /// known. Concurrent calls for one host install its context exactly
    /// once; the signing itself is coalesced by the store.
    pub async fn prepare(&self, host: &str) -> Result<()> {
        if self.known_hosts.lock().unwrap().contains(host) {
            tokio::task::yield_now().await;
            return Ok(());
        }

        let leaf = self.store.sign(host).await?;
        let certified = Arc::new(leaf.certified_key(self.store.ca().cert_der())?);

        let mut known = self.known_hosts.lock().unwrap();
        if known.insert(host.to_string()) {
            self.resolver
                .certs
                .write()
                .unwrap()
                .insert(cache_key(host), certified);
            tracing::debug!(host = %host, "Installed SNI context");
        }
        Ok(())
    }

    /// Port the interception listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    /// Accept loop. Each connection is unwrapped with the leaf matching
    /// its SNI and handed to the request engine.
    pub(crate) async fn run(self: Arc<Self>, engine: Arc<Engine>, listener: TcpListener) {
        let acceptor = TlsAcceptor::from(Arc::new(self.server_config()));

        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept intercepted connection");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let engine = engine.clone();

            tokio::spawn(async move {
                let tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let Some(host) = tls.get_ref().1.server_name().map(str::to_string) else {
                    tracing::debug!(client = %client_addr, "No SNI on intercepted connection");
                    return;
                };

                let service = service_fn(move |req| {
                    let engine = engine.clone();
                    let host = host.clone();
                    async move { request::handle_intercepted(engine, req, host).await }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(TokioIo::new(tls), service)
                    .await
                {
                    let err_str = e.to_string();
                    if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                        tracing::debug!(client = %client_addr, error = %e, "Intercepted connection ended");
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for SniServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniServer")
            .field("port", &self.local_port())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_report;
    use std::future::Future;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    async fn test_server() -> (tempfile::TempDir, Arc<SniServer>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.proxy.cert_dir = dir.path().to_string_lossy().to_string();
        let store = Arc::new(CertStore::init(&config).await.unwrap());
        (dir, SniServer::new(store))
    }

    #[tokio::test]
    async fn test_prepare_installs_context_once() {
        let t = test_report!("Prepare installs one SNI context per cache key");
        let (_dir, server) = test_server().await;

        server.prepare("a.example.com").await.unwrap();
        server.prepare("a.example.com").await.unwrap();
        server.prepare("b.example.com").await.unwrap();

        let contexts = server.resolver.certs.read().unwrap().len();
        t.assert_eq("one shared context", &contexts, &1usize);
        t.assert_eq(
            "both hosts known",
            &server.known_hosts.lock().unwrap().len(),
            &2usize,
        );
        t.assert_eq(
            "one generation",
            &server.store.metrics().generated,
            &1u64,
        );
    }

    #[tokio::test]
    async fn test_prepare_never_resolves_synchronously() {
        let t = test_report!("Prepare yields to the scheduler even for known hosts");
        let (_dir, server) = test_server().await;
        server.prepare("known.example.com").await.unwrap();

        let fut = server.prepare("known.example.com");
        tokio::pin!(fut);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        t.assert_true(
            "first poll is pending",
            matches!(fut.as_mut().poll(&mut cx), Poll::Pending),
        );
        t.assert_true("then resolves", fut.await.is_ok());
    }
}
