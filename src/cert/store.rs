//! Certificate store: wildcard cache keys, on-disk persistence, and
//! race-free coalescing of concurrent signing requests.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use super::authority::{
    remaining_validity, CaMaterial, LeafMaterial, CA_ROTATE_REMAINING, LEAF_ROTATE_REMAINING,
};
use crate::config::Config;
use crate::error::{Error, Result};

pub const CA_CERT_FILE: &str = "Violentca.crt";
pub const CA_PUBLIC_FILE: &str = "Violentca.public";
pub const CA_PRIVATE_FILE: &str = "Violentca.private";

pub const LEAF_CERT_FILE: &str = "Violentcert.crt";
pub const LEAF_PUBLIC_FILE: &str = "Violentcert.public";
pub const LEAF_PRIVATE_FILE: &str = "Violentcert.private";

/// Ready leaves are kept in a bounded LRU; in-flight signings and the
/// CA / proxy-self material are pinned elsewhere and never evicted.
const READY_CACHE_CAPACITY: usize = 1024;

/// Canonical wildcard form of a host name.
///
/// Hosts that differ only in their left-most label share a key:
/// `a.example.com` and `b.example.com` both map to `*.example.com`,
/// `example.com` maps to `*.example.com` too, and single-label names
/// such as `localhost` map to themselves.
pub fn cache_key(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    match labels.len() {
        0 | 1 => host.to_string(),
        2 => format!("*.{}", host),
        _ => {
            let mut labels = labels;
            labels[0] = "*";
            labels.join(".")
        }
    }
}

/// Directory name a cache key is stored under: the leading character is
/// replaced by `+`, which keeps wildcard keys filesystem-safe
/// (`*.example.com` → `+.example.com`). Lookups always go host → key →
/// directory, so the mapping is never reversed.
pub fn storage_dir_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    out.push('+');
    let mut chars = key.chars();
    chars.next();
    out.push_str(chars.as_str());
    out
}

fn read_opt(path: PathBuf) -> Result<Option<String>> {
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::certificate(format!(
            "Failed to read '{}': {}",
            path.display(),
            e
        ))),
    }
}

/// Read a cert/key/public triple, `None` if any file is missing.
fn read_triple(
    dir: &Path,
    cert_name: &str,
    public_name: &str,
    private_name: &str,
) -> Result<Option<(String, String, String)>> {
    let (Some(cert), Some(key), Some(public)) = (
        read_opt(dir.join(cert_name))?,
        read_opt(dir.join(private_name))?,
        read_opt(dir.join(public_name))?,
    ) else {
        return Ok(None);
    };
    Ok(Some((cert, key, public)))
}

/// Persist a triple. The private key goes first and the certificate
/// last, so a directory containing the certificate always contains a
/// complete triple; the in-memory promotion happens only after all
/// three writes succeed.
fn write_triple(
    dir: &Path,
    cert_name: &str,
    public_name: &str,
    private_name: &str,
    cert_pem: &str,
    public_pem: &str,
    key_pem: &str,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::certificate(format!("Failed to create '{}': {}", dir.display(), e)))?;

    let write = |name: &str, content: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, content).map_err(|e| {
            Error::certificate(format!("Failed to write '{}': {}", path.display(), e))
        })?;
        Ok(path)
    };

    let private_path = write(private_name, key_pem)?;
    write(public_name, public_pem)?;
    write(cert_name, cert_pem)?;

    // Only the private key needs restrictive permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&private_path)
            .map_err(|e| Error::certificate(e.to_string()))?
            .permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&private_path, perms)
            .map_err(|e| Error::certificate(e.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = private_path;

    Ok(())
}

/// Counters for cache behaviour, used to assert the at-most-one-signing
/// guarantee.
#[derive(Debug, Clone, Copy)]
pub struct CertStoreMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
}

struct StoreState {
    ready: LruCache<String, Arc<LeafMaterial>>,
    /// Keys with a signing in flight, mapped to the waiters that will
    /// be resolved, in enqueue order, when it completes.
    pending: HashMap<String, Vec<oneshot::Sender<Arc<LeafMaterial>>>>,
}

enum SignRole {
    Hit(Arc<LeafMaterial>),
    Owner,
    Waiter(oneshot::Receiver<Arc<LeafMaterial>>),
}

/// The certificate store: CA material, the proxy-self leaf, and the
/// per-cache-key leaf cache backed by the on-disk layout.
pub struct CertStore {
    root: PathBuf,
    ca: Arc<CaMaterial>,
    self_leaf: Arc<LeafMaterial>,
    state: Mutex<StoreState>,
    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,
}

impl CertStore {
    /// Load or generate the CA and the proxy-self leaf. Idempotent;
    /// must complete before [`CertStore::sign`] is called.
    pub async fn init(config: &Config) -> Result<Self> {
        let root = PathBuf::from(&config.proxy.cert_dir);
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::certificate(format!("Failed to create '{}': {}", root.display(), e))
        })?;

        let ca = Arc::new(Self::init_ca(&root, config).await?);
        let self_leaf = Self::init_self_leaf(&root, config, &ca).await?;

        Ok(Self {
            root,
            ca,
            self_leaf,
            state: Mutex::new(StoreState {
                ready: LruCache::new(NonZeroUsize::new(READY_CACHE_CAPACITY).unwrap()),
                pending: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generated: AtomicU64::new(0),
        })
    }

    async fn init_ca(root: &Path, config: &Config) -> Result<CaMaterial> {
        if let Some((cert_pem, key_pem, _)) =
            read_triple(root, CA_CERT_FILE, CA_PUBLIC_FILE, CA_PRIVATE_FILE)?
        {
            match remaining_validity(&cert_pem) {
                Ok(remaining) if remaining >= CA_ROTATE_REMAINING => {
                    tracing::info!("Loaded CA certificate");
                    return CaMaterial::load(&cert_pem, &key_pem);
                }
                Ok(_) => {
                    tracing::info!(
                        "CA certificate is nearing expiry, generating a new one. \
                         Certificates signed by the old CA may still be in use."
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stored CA certificate is unreadable, regenerating");
                }
            }
        } else {
            tracing::info!("No CA certificate found, generating one");
        }

        let domains = config.proxy.proxy_domains.clone();
        let ips = config.proxy.proxy_ips.clone();
        let ca = tokio::task::spawn_blocking(move || CaMaterial::generate(&domains, &ips))
            .await
            .map_err(|e| Error::certificate(format!("CA generation task failed: {}", e)))??;

        write_triple(
            root,
            CA_CERT_FILE,
            CA_PUBLIC_FILE,
            CA_PRIVATE_FILE,
            &ca.cert_pem,
            &ca.public_pem,
            &ca.key_pem,
        )?;
        Ok(ca)
    }

    async fn init_self_leaf(
        root: &Path,
        config: &Config,
        ca: &Arc<CaMaterial>,
    ) -> Result<Arc<LeafMaterial>> {
        let self_host = config
            .proxy
            .proxy_domains
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());
        let key = cache_key(&self_host);
        let dir = root.join(storage_dir_name(&key));

        if let Some((cert_pem, key_pem, public_pem)) =
            read_triple(&dir, LEAF_CERT_FILE, LEAF_PUBLIC_FILE, LEAF_PRIVATE_FILE)?
        {
            match remaining_validity(&cert_pem) {
                Ok(remaining) if remaining >= LEAF_ROTATE_REMAINING => {
                    tracing::debug!(host = %self_host, "Loaded proxy-self certificate");
                    return Ok(Arc::new(LeafMaterial::from_pem(
                        &cert_pem,
                        &key_pem,
                        &public_pem,
                    )?));
                }
                Ok(_) => {
                    tracing::info!("Proxy-self certificate is nearing expiry, regenerating");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Proxy-self certificate is unreadable, regenerating");
                }
            }
        }

        let domains = config.proxy.proxy_domains.clone();
        let ips = config.proxy.proxy_ips.clone();
        let issuing_ca = ca.clone();
        let leaf = tokio::task::spawn_blocking(move || issuing_ca.issue_leaf(&domains, &ips))
            .await
            .map_err(|e| Error::certificate(format!("signing task failed: {}", e)))??;

        write_triple(
            &dir,
            LEAF_CERT_FILE,
            LEAF_PUBLIC_FILE,
            LEAF_PRIVATE_FILE,
            &leaf.cert_pem,
            &leaf.public_pem,
            &leaf.key_pem,
        )?;
        Ok(Arc::new(leaf))
    }

    /// Obtain the leaf for `host`, loading or generating it on first
    /// use.
    ///
    /// Concurrent calls for hosts sharing a cache key coalesce onto a
    /// single signing; waiters are resolved in call order. The result
    /// is always delivered on a later scheduler tick, even when it is
    /// already cached.
    pub async fn sign(&self, host: &str) -> Result<Arc<LeafMaterial>> {
        let key = cache_key(host);

        let role = {
            let mut state = self.state.lock().unwrap();
            if let Some(material) = state.ready.get(&key) {
                SignRole::Hit(material.clone())
            } else if let Some(waiters) = state.pending.get_mut(&key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                SignRole::Waiter(rx)
            } else {
                state.pending.insert(key.clone(), Vec::new());
                SignRole::Owner
            }
        };

        let rx = match role {
            SignRole::Hit(material) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
                return Ok(material);
            }
            SignRole::Waiter(rx) => rx,
            SignRole::Owner => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let result = self.load_or_generate(host, &key).await;

                let waiters = {
                    let mut state = self.state.lock().unwrap();
                    if let Ok(material) = &result {
                        state.ready.put(key.clone(), material.clone());
                    }
                    state.pending.remove(&key).unwrap_or_default()
                };

                return match result {
                    Ok(material) => {
                        for waiter in waiters {
                            let _ = waiter.send(material.clone());
                        }
                        tokio::task::yield_now().await;
                        Ok(material)
                    }
                    Err(e) => {
                        // Dropping the waiters resolves them with an error.
                        tracing::error!(host = %host, error = %e, "Leaf signing failed");
                        Err(e)
                    }
                };
            }
        };

        rx.await
            .map_err(|_| Error::certificate(format!("signing for '{}' failed", host)))
    }

    async fn load_or_generate(&self, host: &str, key: &str) -> Result<Arc<LeafMaterial>> {
        let dir = self.root.join(storage_dir_name(key));

        if let Some((cert_pem, key_pem, public_pem)) =
            read_triple(&dir, LEAF_CERT_FILE, LEAF_PUBLIC_FILE, LEAF_PRIVATE_FILE)?
        {
            match remaining_validity(&cert_pem) {
                Ok(remaining) if remaining >= LEAF_ROTATE_REMAINING => {
                    match LeafMaterial::from_pem(&cert_pem, &key_pem, &public_pem) {
                        Ok(leaf) => {
                            tracing::debug!(host = %host, key = %key, "Loaded leaf from disk");
                            return Ok(Arc::new(leaf));
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Stored leaf is unreadable, regenerating");
                        }
                    }
                }
                Ok(_) => {
                    tracing::debug!(key = %key, "Stored leaf is nearing expiry, regenerating");
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Stored leaf is unreadable, regenerating");
                }
            }
        }

        let ca = self.ca.clone();
        let mut dns_names = vec![host.to_string()];
        if key != host {
            dns_names.push(key.to_string());
        }
        let leaf = tokio::task::spawn_blocking(move || ca.issue_leaf(&dns_names, &[]))
            .await
            .map_err(|e| Error::certificate(format!("signing task failed: {}", e)))??;

        write_triple(
            &dir,
            LEAF_CERT_FILE,
            LEAF_PUBLIC_FILE,
            LEAF_PRIVATE_FILE,
            &leaf.cert_pem,
            &leaf.public_pem,
            &leaf.key_pem,
        )?;
        self.generated.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host = %host, key = %key, "Signed new leaf");
        Ok(Arc::new(leaf))
    }

    pub fn ca(&self) -> &Arc<CaMaterial> {
        &self.ca
    }

    pub fn self_leaf(&self) -> &Arc<LeafMaterial> {
        &self.self_leaf
    }

    /// Server config for the main listener when it terminates TLS
    /// itself.
    pub fn self_server_config(&self) -> Result<rustls::ServerConfig> {
        self.self_leaf.server_config(self.ca.cert_der())
    }

    pub fn metrics(&self) -> CertStoreMetrics {
        CertStoreMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
