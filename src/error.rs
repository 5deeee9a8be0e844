//! Error types for violentproxy

use std::io;

/// Main error type for the proxy engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Malformed client request: {0}")]
    MalformedRequest(String),

    #[error("Request denied by patcher")]
    Denied,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Body decode error: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedRequest(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Errors that must take the whole process down rather than just the
    /// connection that hit them: key generation and certificate
    /// persistence failures leave the proxy unable to intercept anything.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Certificate(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where crash reports should be filed.
pub const SUPPORT_URL: &str = "https://github.com/jspenguin2017/Violentproxy/issues";

/// Log the alarm banners and the support URL, then terminate.
///
/// Used for the fatal error kinds; per-connection failures never come
/// through here.
pub fn fatal(err: &Error) -> ! {
    for _ in 0..3 {
        tracing::error!("=============== Violentproxy has crashed ===============");
    }
    tracing::error!(error = %err, "Fatal error");
    tracing::error!("Please report this issue at {}", SUPPORT_URL);
    std::process::exit(1);
}
