//! Outbound connection management: keep-alive agents keyed by the
//! negotiated keep-alive parameters.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::HeaderMap;
use hyper::{Request, Response, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Pool key derived from a client request's keep-alive negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKey {
    /// Connection is not reusable.
    Close,
    /// Keep-alive without an explicit timeout.
    Default,
    /// Keep-alive with a client-requested idle timeout, in
    /// milliseconds.
    Timeout(u64),
}

impl AgentKey {
    /// Apply the selection policy:
    ///
    /// 1. HTTP/1.0 without `Connection: keep-alive`, or any request
    ///    with `Connection: close`, uses the close agent.
    /// 2. Otherwise a `Keep-Alive: timeout=T` header selects the
    ///    T-second agent; a malformed `T` is ignored.
    /// 3. Otherwise the default keep-alive agent.
    pub fn from_request(version: Version, headers: &HeaderMap) -> Self {
        let wants_keep_alive = has_token(headers, "connection", "keep-alive");
        let wants_close = has_token(headers, "connection", "close");
        if (version == Version::HTTP_10 && !wants_keep_alive) || wants_close {
            return AgentKey::Close;
        }
        if let Some(value) = headers.get("keep-alive").and_then(|v| v.to_str().ok()) {
            if let Some(ms) = parse_keep_alive_timeout(value) {
                return AgentKey::Timeout(ms);
            }
        }
        AgentKey::Default
    }
}

fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Parse `timeout=T` out of a `Keep-Alive` header value. `T` must be a
/// finite positive number of seconds; the result is in milliseconds.
fn parse_keep_alive_timeout(value: &str) -> Option<u64> {
    for pair in value.split(',') {
        let Some((key, val)) = pair.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("timeout") {
            continue;
        }
        let Ok(seconds) = val.trim().parse::<f64>() else {
            continue;
        };
        if seconds.is_finite() && seconds > 0.0 {
            return Some((seconds * 1000.0) as u64);
        }
    }
    None
}

struct PooledConn {
    sender: SendRequest<Full<Bytes>>,
    parked_at: Instant,
}

/// An outbound connection manager. Owns idle connections per upstream
/// authority and reuses them when its keep-alive policy allows.
pub struct Agent {
    keep_alive: bool,
    idle_timeout: Option<Duration>,
    idle: Mutex<HashMap<String, VecDeque<PooledConn>>>,
}

impl Agent {
    fn new(key: AgentKey) -> Self {
        let (keep_alive, idle_timeout) = match key {
            AgentKey::Close => (false, None),
            AgentKey::Default => (true, None),
            AgentKey::Timeout(ms) => (true, Some(Duration::from_millis(ms))),
        };
        Self {
            keep_alive,
            idle_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Send a fully-buffered request to `host:port`, reusing an idle
    /// connection when one is available, and return the fully-buffered
    /// response. `tls` carries the client config for HTTPS upstreams.
    pub async fn request(
        &self,
        tls: Option<Arc<ClientConfig>>,
        host: &str,
        port: u16,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>> {
        let authority = format!("{}:{}", host, port);

        if let Some(sender) = self.checkout(&authority) {
            // A parked connection may have died while idle; fall back
            // to a fresh dial with a copy of the request.
            let fallback = clone_request(&req);
            match self.dispatch(sender, &authority, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::debug!(authority = %authority, error = %e, "Pooled connection failed, redialing");
                    let sender = self.dial(tls, host, port).await?;
                    return self.dispatch(sender, &authority, fallback).await;
                }
            }
        }

        let sender = self.dial(tls, host, port).await?;
        self.dispatch(sender, &authority, req).await
    }

    async fn dispatch(
        &self,
        mut sender: SendRequest<Full<Bytes>>,
        authority: &str,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>> {
        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::upstream(format!("Request to {} failed: {}", authority, e)))?;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                Error::upstream(format!("Reading response from {} failed: {}", authority, e))
            })?
            .to_bytes();

        self.park(authority, sender);
        Ok(Response::from_parts(parts, body))
    }

    fn checkout(&self, authority: &str) -> Option<SendRequest<Full<Bytes>>> {
        let mut idle = self.idle.lock().unwrap();
        let queue = idle.get_mut(authority)?;
        while let Some(conn) = queue.pop_front() {
            if conn.sender.is_closed() || !conn.sender.is_ready() {
                continue;
            }
            if let Some(timeout) = self.idle_timeout {
                if conn.parked_at.elapsed() > timeout {
                    continue;
                }
            }
            return Some(conn.sender);
        }
        None
    }

    fn park(&self, authority: &str, sender: SendRequest<Full<Bytes>>) {
        if !self.keep_alive || sender.is_closed() {
            return;
        }
        self.idle
            .lock()
            .unwrap()
            .entry(authority.to_string())
            .or_default()
            .push_back(PooledConn {
                sender,
                parked_at: Instant::now(),
            });
    }

    async fn dial(
        &self,
        tls: Option<Arc<ClientConfig>>,
        host: &str,
        port: u16,
    ) -> Result<SendRequest<Full<Bytes>>> {
        let addr = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::upstream(format!("Failed to connect to {}: {}", addr, e)))?;

        let sender = match tls {
            Some(config) => {
                let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                    Error::upstream(format!("Invalid server name '{}': {}", host, e))
                })?;
                let connector = TlsConnector::from(config);
                let stream = connector.connect(server_name, tcp).await.map_err(|e| {
                    Error::upstream(format!("TLS connection to {} failed: {}", host, e))
                })?;

                let (sender, conn) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|e| Error::upstream(format!("HTTP handshake failed: {}", e)))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, "Upstream connection error");
                    }
                });
                sender
            }
            None => {
                let (sender, conn) = http1::handshake(TokioIo::new(tcp))
                    .await
                    .map_err(|e| Error::upstream(format!("HTTP handshake failed: {}", e)))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, "Upstream connection error");
                    }
                });
                sender
            }
        };

        Ok(sender)
    }
}

fn clone_request(req: &Request<Full<Bytes>>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version());
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }
    builder
        .body(req.body().clone())
        .expect("rebuilding a valid request cannot fail")
}

/// Agents keyed by keep-alive parameters, one keyspace per transport.
/// Agents are never evicted; the keyspace is bounded by the set of
/// observed timeouts.
pub struct AgentPool {
    plain: Mutex<HashMap<AgentKey, Arc<Agent>>>,
    tls: Mutex<HashMap<AgentKey, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self {
            plain: Mutex::new(HashMap::new()),
            tls: Mutex::new(HashMap::new()),
        }
    }

    /// Select the agent for a client request, creating it on first use.
    pub fn get(&self, version: Version, headers: &HeaderMap, use_tls: bool) -> Arc<Agent> {
        let key = AgentKey::from_request(version, headers);
        let pool = if use_tls { &self.tls } else { &self.plain };
        pool.lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(Agent::new(key)))
            .clone()
    }
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new()
    }
}
