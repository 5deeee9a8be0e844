//! The engine context: owns the certificate store, the agent pools,
//! the dynamic TLS server handle, the patcher slots, and configuration.

use rustls::{ClientConfig, RootCertStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::agent::AgentPool;
use crate::cert::CertStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::patch::{
    BinaryPatcher, ConnectPatcher, DefaultPatcher, RequestPatcher, TextPatcher,
};
use crate::proxy::SniServer;

pub struct Engine {
    config: Config,
    store: Arc<CertStore>,
    sni: Arc<SniServer>,
    agents: AgentPool,
    upstream_tls: Mutex<Arc<ClientConfig>>,
    request_patcher: Mutex<Arc<dyn RequestPatcher>>,
    connect_patcher: Mutex<Arc<dyn ConnectPatcher>>,
    text_patcher: Mutex<Arc<dyn TextPatcher>>,
    binary_patcher: Mutex<Arc<dyn BinaryPatcher>>,
    next_request_id: AtomicU64,
}

impl Engine {
    /// Initialise the engine: CA and proxy-self material are loaded or
    /// generated before anything is served.
    pub async fn init(
        config: Config,
        upstream_tls: Option<Arc<ClientConfig>>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(CertStore::init(&config).await?);
        let sni = SniServer::new(store.clone());

        let upstream_tls = match upstream_tls {
            Some(tls) => tls,
            None => Arc::new(build_upstream_tls(&config)?),
        };

        let default = Arc::new(DefaultPatcher);
        Ok(Arc::new(Self {
            config,
            store,
            sni,
            agents: AgentPool::new(),
            upstream_tls: Mutex::new(upstream_tls),
            request_patcher: Mutex::new(default.clone()),
            connect_patcher: Mutex::new(default.clone()),
            text_patcher: Mutex::new(default.clone()),
            binary_patcher: Mutex::new(default),
            next_request_id: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CertStore> {
        &self.store
    }

    pub fn sni(&self) -> &Arc<SniServer> {
        &self.sni
    }

    pub fn agents(&self) -> &AgentPool {
        &self.agents
    }

    pub fn upstream_tls(&self) -> Arc<ClientConfig> {
        self.upstream_tls.lock().unwrap().clone()
    }

    /// Replace the client config used for upstream TLS (testing seam).
    pub fn set_upstream_tls(&self, config: Arc<ClientConfig>) {
        *self.upstream_tls.lock().unwrap() = config;
    }

    /// Apply the configured upstream port override, if any.
    pub fn upstream_port(&self, port: u16) -> u16 {
        self.config.proxy.upstream_override_port.unwrap_or(port)
    }

    /// Next transaction id: unique per process, monotonically
    /// increasing. CONNECT tunnels and the requests decrypted out of
    /// them draw from the same sequence.
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_patcher(&self) -> Arc<dyn RequestPatcher> {
        self.request_patcher.lock().unwrap().clone()
    }

    pub fn set_request_patcher(&self, patcher: Arc<dyn RequestPatcher>) {
        *self.request_patcher.lock().unwrap() = patcher;
    }

    pub fn connect_patcher(&self) -> Arc<dyn ConnectPatcher> {
        self.connect_patcher.lock().unwrap().clone()
    }

    pub fn set_connect_patcher(&self, patcher: Arc<dyn ConnectPatcher>) {
        *self.connect_patcher.lock().unwrap() = patcher;
    }

    pub fn text_patcher(&self) -> Arc<dyn TextPatcher> {
        self.text_patcher.lock().unwrap().clone()
    }

    pub fn set_text_patcher(&self, patcher: Arc<dyn TextPatcher>) {
        *self.text_patcher.lock().unwrap() = patcher;
    }

    pub fn binary_patcher(&self) -> Arc<dyn BinaryPatcher> {
        self.binary_patcher.lock().unwrap().clone()
    }

    pub fn set_binary_patcher(&self, patcher: Arc<dyn BinaryPatcher>) {
        *self.binary_patcher.lock().unwrap() = patcher;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bind_address", &self.config.proxy.bind_address)
            .finish_non_exhaustive()
    }
}

fn build_upstream_tls(config: &Config) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    if let Some(path) = &config.proxy.upstream_tls_ca {
        let pem = std::fs::read(path)
            .map_err(|e| Error::config(format!("Failed to read upstream TLS CA '{}': {}", path, e)))?;
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert =
                cert.map_err(|e| Error::tls(format!("Bad certificate in '{}': {}", path, e)))?;
            root_store
                .add(cert)
                .map_err(|e| Error::tls(format!("Unusable certificate in '{}': {}", path, e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut tls = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(tls)
}
