//! Violentproxy - an HTTPS-intercepting proxy engine
//!
//! This crate provides a man-in-the-middle proxy that terminates
//! client-side TLS with a locally-trusted certificate authority,
//! inspects and optionally rewrites traffic through replaceable
//! patchers, and forwards it to the real origin.
//!
//! # Features
//!
//! - **On-demand certificate authority**: per-host leaf certificates
//!   with a wildcard-aware cache, on-disk persistence, and
//!   validity-based rotation
//! - **CONNECT interception**: TLS handshake sniffing on tunnels, with
//!   TLS traffic redirected into an SNI-multiplexed local server
//! - **Patcher pipeline**: request, connect, text-response, and
//!   binary-response hooks with a closed decision set
//! - **Keep-alive pooling**: outbound connections pooled per negotiated
//!   keep-alive parameters
//!
//! # Example
//!
//! ```no_run
//! use violentproxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let mut server = ProxyServer::new(config);
//!     server.bind().await?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.serve(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod body;
pub mod cert;
pub mod config;
pub mod engine;
pub mod error;
pub mod patch;
pub mod proxy;
#[doc(hidden)]
pub mod test_support;

pub use agent::{Agent, AgentKey, AgentPool};
pub use cert::{CaMaterial, CertStore, LeafMaterial};
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use patch::{
    BinaryPatcher, ConnectDecision, ConnectPatcher, DefaultPatcher, PatchContext,
    RequestDecision, RequestPatcher, TextPatcher,
};
pub use proxy::{ProxyServer, SniServer};
