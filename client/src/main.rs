//! OTS Certificate Client
//!
//! Registers with an OTS certificate server, obtains a certificate for the
//! assigned hostname, and serves a demo page over HTTPS with it.
//!
//! ## Usage
//!
//! ```bash
//! # Register with the address of eth0 and serve on the configured port
//! ots-cert-client --interface eth0
//!
//! # Register an explicit address, only fetch the certificate
//! ots-cert-client --ip 10.0.0.5 --no-serve
//! ```

mod config;
mod errors;
mod hello;
mod provision;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use ots_cert_server::certs::{
    encode_chain_pem, generate_key_and_csr, write_file, write_key_and_chain,
};
use ots_cert_server::net::local_ipv4;
use ots_cert_server::tls::{bind, build_tls_config, serve_https};

use config::Config;
use hello::HelloPage;
use provision::ProvisioningClient;

/// OTS Certificate Client
#[derive(Parser, Debug)]
#[command(name = "ots-cert-client")]
#[command(author = "OTS Cert Team")]
#[command(version)]
#[command(about = "Obtains a hostname and certificate from an OTS certificate server", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long, default_value = "ots-cert-client.toml")]
    config: PathBuf,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,

    /// Network interface to take the registered address from
    #[arg(short, long)]
    interface: Option<String>,

    /// Address to register, skips interface discovery
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Stop after writing the certificate instead of serving the demo page
    #[arg(long)]
    no_serve: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn registered_address(config: &Config) -> Result<Ipv4Addr> {
    match config.ip {
        Some(ip) => Ok(ip),
        None => local_ipv4(config.interface.as_deref()).context("Failed to determine local address"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config = Config::load(&args.config)?;
    if args.interface.is_some() {
        config.interface = args.interface.clone();
    }
    if args.ip.is_some() {
        config.ip = args.ip;
    }
    if args.dump_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    config.validate()?;

    let client = ProvisioningClient::new(
        config.registration_url(),
        config.certificate_request_url(),
        config.ca_certificate.as_deref(),
    )?;

    let identity = Uuid::new_v4();
    let ip = registered_address(&config)?;
    info!("Registering {} at {}", identity, ip);

    let hostname = client.register(identity, ip).await?;
    info!("Assigned hostname {}", hostname);

    let material = generate_key_and_csr(&hostname)?;
    if let Some(csr_path) = &config.csr_filename {
        write_file(csr_path, material.csr_pem.as_bytes()).await?;
    }

    let chain = client.request_certificate(identity, &material.csr_der).await?;
    write_key_and_chain(
        &config.key_filename,
        &material.key_pem,
        &config.cert_filename,
        &encode_chain_pem(&chain),
    )
    .await?;
    info!(
        "Certificate chain ({} certificates) written to {}",
        chain.len(),
        config.cert_filename.display()
    );

    if args.no_serve {
        return Ok(());
    }

    let tls_config = build_tls_config(&config.cert_filename, &config.key_filename)?;
    let listener = bind(SocketAddr::from(([0, 0, 0, 0], config.web_server.port))).await?;
    info!("Serving https://{}:{}/", hostname, config.web_server.port);

    tokio::select! {
        _ = serve_https(listener, tls_config, Arc::new(HelloPage::new(&hostname))) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
