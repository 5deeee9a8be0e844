//! Proxy listeners and the request / connect engines

mod connect;
mod request;
mod response;
mod rewind;
mod server;
mod sni;

pub use connect::{is_tls_client_hello, parse_connect_target};
pub use response::DEFAULT_SERVER;
pub use server::ProxyServer;
pub use sni::SniServer;
