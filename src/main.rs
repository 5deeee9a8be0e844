//! Violentproxy CLI - an HTTPS-intercepting proxy engine

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use violentproxy::cert::{CA_CERT_FILE, CA_PRIVATE_FILE, CA_PUBLIC_FILE};
use violentproxy::{CaMaterial, Config, ProxyServer};

#[derive(Parser)]
#[command(name = "violentproxy")]
#[command(about = "An HTTPS-intercepting proxy with a local certificate authority")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Certificate directory (overrides config)
        #[arg(long)]
        cert_dir: Option<PathBuf>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Log level 0..4 (overrides config)
        #[arg(short, long)]
        log_level: Option<u8>,
    },

    /// Generate CA material ahead of the first run
    GenerateCa {
        /// Output directory for the CA files
        #[arg(short, long, default_value = "./Violentcert")]
        out: PathBuf,

        /// DNS names to place on the CA certificate
        #[arg(long, default_value = "localhost")]
        domain: Vec<String>,

        /// IP addresses to place on the CA certificate
        #[arg(long, default_value = "127.0.0.1")]
        ip: Vec<String>,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Alarm banners and the support URL go out before the default panic
/// handling re-raises.
fn install_panic_banner() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        for _ in 0..3 {
            eprintln!("=============== Violentproxy has crashed ===============");
        }
        eprintln!(
            "Please report this issue at {}",
            violentproxy::error::SUPPORT_URL
        );
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    install_panic_banner();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            cert_dir,
            bind,
            log_level,
        } => {
            let mut cfg = if let Some(config_path) = config {
                Config::from_file(&config_path)?
            } else {
                Config::parse("")?
            };

            if let Some(dir) = cert_dir {
                cfg.proxy.cert_dir = dir.to_string_lossy().to_string();
            }
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            if let Some(level) = log_level {
                cfg.logging.level = level.min(4);
            }

            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.logging.filter_directive()));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            let mut server = ProxyServer::new(cfg);
            let (listen_addr, tls_addr) = server.bind().await?;
            tracing::info!(listener = %listen_addr, interception = %tls_addr, "Violentproxy ready");
            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}", listen_addr);
            tracing::info!("  export HTTPS_PROXY=http://{}", listen_addr);

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::GenerateCa { out, domain, ip } => {
            std::fs::create_dir_all(&out)?;

            println!("Generating CA material...");
            let ca = CaMaterial::generate(&domain, &ip)?;

            let cert_path = out.join(CA_CERT_FILE);
            std::fs::write(&cert_path, &ca.cert_pem)?;
            std::fs::write(out.join(CA_PUBLIC_FILE), &ca.public_pem)?;
            std::fs::write(out.join(CA_PRIVATE_FILE), &ca.key_pem)?;

            println!("CA generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!();
            println!("To trust the CA on Ubuntu/Debian:");
            println!(
                "  sudo cp {} /usr/local/share/ca-certificates/violentproxy.crt",
                cert_path.display()
            );
            println!("  sudo update-ca-certificates");
            println!();
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!("  TLS bind address: {}", cfg.proxy.tls_bind_address);
            println!("  Listener TLS: {}", cfg.proxy.use_tls);
            println!("  Certificate dir: {}", cfg.proxy.cert_dir);
            println!("  Proxy domains: {}", cfg.proxy.proxy_domains.join(", "));
            println!("  Proxy IPs: {}", cfg.proxy.proxy_ips.join(", "));
            println!("  Log level: {}", cfg.logging.level);
        }
    }

    Ok(())
}
