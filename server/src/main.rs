//! OTS Certificate Server Entry Point
//!
//! Provisions itself (address, hostname, certificate, A record) and then
//! serves the registration API:
//!
//! - `POST /register` - assign a hostname to a client and publish its A record
//! - `POST /get_certificate` - issue a DNS-01 validated certificate for it
//!
//! ## Usage
//!
//! ```bash
//! # Run with ./ots-cert-server.toml
//! ots-cert-server
//!
//! # Run with a custom config file, taking the address from eth1
//! ots-cert-server --config /etc/ots/server.toml --interface eth1
//!
//! # Print the effective configuration (secrets redacted)
//! ots-cert-server --dump-config
//! ```
//!
//! ## Configuration
//!
//! TOML file plus `OTS_CERT_CLOUDFLARE_API_TOKEN` for the DNS API token.
//! `RUST_LOG` overrides the log level.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use ots_cert_server::acme::{DomainValidator, LetsEncrypt};
use ots_cert_server::api::ProvisioningService;
use ots_cert_server::certs::CertificateManager;
use ots_cert_server::config::{Config, DnsProviderKind};
use ots_cert_server::dns::{
    CloudflareAuth, CloudflareZone, DnsRecordManager, InMemoryZone, RecordType, ZoneProvider,
};
use ots_cert_server::names::WordPairGenerator;
use ots_cert_server::net::local_ipv4;
use ots_cert_server::registry::RegistrationStore;
use ots_cert_server::retry::{Sleeper, TokioSleeper};
use ots_cert_server::tls::{bind, build_tls_config, serve_http, serve_https};

/// OTS Certificate Server
#[derive(Parser, Debug)]
#[command(name = "ots-cert-server")]
#[command(author = "OTS Cert Team")]
#[command(version)]
#[command(about = "Hands out hostnames and DNS-01 validated certificates", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long, default_value = "ots-cert-server.toml")]
    config: PathBuf,

    /// Print the effective configuration with secrets redacted and exit
    #[arg(long)]
    dump_config: bool,

    /// Network interface to take the server's own address from
    #[arg(short, long)]
    interface: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
        Config::default()
    };

    config.apply_env_overrides();
    if let Some(interface) = &args.interface {
        config.interface = Some(interface.clone());
    }

    Ok(config)
}

async fn build_zone_provider(config: &Config) -> anyhow::Result<Arc<dyn ZoneProvider>> {
    match config.dns.provider {
        DnsProviderKind::Cloudflare => {
            let cf = &config.cloudflare;
            let auth = match (&cf.api_token, &cf.api_email, &cf.api_key) {
                (Some(token), _, _) => CloudflareAuth::Token(token.clone()),
                (None, Some(email), Some(key)) => CloudflareAuth::Key {
                    email: email.clone(),
                    key: key.clone(),
                },
                _ => anyhow::bail!("Cloudflare credentials missing"),
            };

            let zone = CloudflareZone::connect(&config.domain, auth, config.dns.record_ttl)
                .await
                .with_context(|| format!("Failed to open Cloudflare zone {}", config.domain))?;
            info!("DNS provider: cloudflare (zone {})", zone.zone_id());
            Ok(Arc::new(zone))
        }
        DnsProviderKind::Memory => {
            warn!("DNS provider: memory - records are not published anywhere");
            Ok(Arc::new(InMemoryZone::new()))
        }
    }
}

/// The label the server runs under, registered so no client can receive it
async fn own_hostname(
    config: &Config,
    store: &RegistrationStore,
    ip: IpAddr,
) -> anyhow::Result<String> {
    match &config.hostname {
        Some(hostname) => {
            if store.find_by_hostname(hostname).await?.is_none() {
                store.claim_hostname(Uuid::new_v4(), hostname, ip).await?;
            }
            Ok(hostname.clone())
        }
        None => {
            let registration = store.register_client(Uuid::new_v4(), ip).await?;
            info!(
                "Allocated hostname {}; set `hostname` in the config to keep it across restarts",
                registration.hostname
            );
            Ok(registration.hostname)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("Starting OTS Certificate Server v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    if args.dump_config {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
        return Ok(());
    }
    config.validate()?;

    let store = Arc::new(
        RegistrationStore::open(&config.database_path, Arc::new(WordPairGenerator::new()))
            .with_context(|| {
                format!("Failed to open registration store {}", config.database_path.display())
            })?,
    );
    info!("Registration store: {}", config.database_path.display());

    let dns = DnsRecordManager::new(build_zone_provider(&config).await?);

    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
    let authority = Arc::new(LetsEncrypt::new(
        &config.acme.directory_url,
        config.acme.contact_email.clone(),
        config.acme.certificate_poll(),
        sleeper.clone(),
    ));
    let validator = Arc::new(DomainValidator::new(
        authority,
        dns.clone(),
        sleeper,
        config.acme.validation_timing(),
    ));
    info!("ACME directory: {}", config.acme.directory_url);

    let ip = match config.public_ip {
        Some(ip) => ip,
        None => IpAddr::V4(
            local_ipv4(config.interface.as_deref()).context("Failed to determine server address")?,
        ),
    };
    let hostname = own_hostname(&config, &store, ip).await?;
    let fqdn = config.fqdn(&hostname);
    info!("Server identity: {} ({})", fqdn, ip);

    let web = &config.web_server;
    if web.tls {
        CertificateManager::new(validator.clone())
            .ensure_certificate(&fqdn, &web.cert_filename, &web.key_filename, web.csr_filename.as_deref())
            .await
            .with_context(|| format!("Failed to obtain a certificate for {}", fqdn))?;
    } else {
        info!("TLS disabled, skipping server certificate");
    }

    dns.reconcile(RecordType::A, &fqdn, &ip.to_string())
        .await
        .with_context(|| format!("Failed to publish A record for {}", fqdn))?;

    let service = Arc::new(ProvisioningService::new(store, dns, validator, &config.domain));
    let listener = bind(SocketAddr::new(web.ip, web.port)).await?;

    let tls_config = if web.tls {
        Some(build_tls_config(&web.cert_filename, &web.key_filename)?)
    } else {
        None
    };
    let serve = async move {
        match tls_config {
            Some(tls_config) => serve_https(listener, tls_config, service).await,
            None => serve_http(listener, service).await,
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
