//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address for the main listener
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Address for the dynamic TLS (interception) listener
    #[serde(default = "default_tls_bind_address")]
    pub tls_bind_address: String,

    /// Whether the main listener itself terminates TLS using the
    /// proxy-self leaf certificate
    #[serde(default)]
    pub use_tls: bool,

    /// DNS names placed on the proxy-self leaf certificate
    #[serde(default = "default_proxy_domains")]
    pub proxy_domains: Vec<String>,

    /// IP addresses placed on the proxy-self leaf certificate
    #[serde(default = "default_proxy_ips")]
    pub proxy_ips: Vec<String>,

    /// Directory holding the CA and all signed leaf certificates
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Override upstream port for all forwarded connections (testing only)
    #[serde(default)]
    pub upstream_override_port: Option<u16>,

    /// Path to PEM CA cert to trust for upstream TLS (testing only)
    #[serde(default)]
    pub upstream_tls_ca: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tls_bind_address: default_tls_bind_address(),
            use_tls: false,
            proxy_domains: default_proxy_domains(),
            proxy_ips: default_proxy_ips(),
            cert_dir: default_cert_dir(),
            upstream_override_port: None,
            upstream_tls_ca: None,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_tls_bind_address() -> String {
    "127.0.0.1:12346".to_string()
}

fn default_proxy_domains() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_proxy_ips() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_cert_dir() -> String {
    "./Violentcert".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Verbosity: 0=silent, 1=error, 2=+warning, 3=+notice, 4=+info
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> u8 {
    4
}

impl LoggingConfig {
    /// Map the numeric level onto a tracing filter directive.
    pub fn filter_directive(&self) -> &'static str {
        match self.level {
            0 => "off",
            1 => "error",
            2 => "warn",
            3 => "info",
            _ => "debug",
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.logging.level > 4 {
            return Err(Error::config(format!(
                "log level must be 0..4, got {}",
                self.logging.level
            )));
        }
        if self.proxy.proxy_domains.is_empty() {
            return Err(Error::config("proxy_domains must not be empty"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
