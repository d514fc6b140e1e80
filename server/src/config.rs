use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acme::{ValidationTiming, LETS_ENCRYPT_STAGING};
use crate::retry::RetryPolicy;

/// Environment variable that overrides `cloudflare.api_token`
pub const CLOUDFLARE_TOKEN_ENV: &str = "OTS_CERT_CLOUDFLARE_API_TOKEN";

const REDACTED: &str = "<redacted>";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parent domain every hostname is allocated under
    pub domain: String,
    /// Fixed label for the server itself; allocated when unset
    pub hostname: Option<String>,
    /// Interface to take the server's own address from
    pub interface: Option<String>,
    /// Address to publish for the server, skips interface discovery
    pub public_ip: Option<IpAddr>,
    /// SQLite file holding client registrations
    pub database_path: PathBuf,
    pub dns: DnsSettings,
    pub cloudflare: CloudflareSettings,
    pub acme: AcmeSettings,
    pub web_server: WebServerSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    Cloudflare,
    /// In-process zone; nothing is published
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub provider: DnsProviderKind,
    /// TTL for published records in seconds (1 = provider automatic)
    pub record_ttl: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareSettings {
    /// Scoped API token (preferred)
    pub api_token: Option<String>,
    /// Legacy global key authentication
    pub api_email: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub contact_email: Option<String>,
    pub propagation_delay_secs: u64,
    pub propagation_attempts: u32,
    pub propagation_interval_secs: u64,
    pub authorization_attempts: u32,
    pub authorization_interval_secs: u64,
    pub certificate_poll_attempts: u32,
    pub certificate_poll_interval_secs: u64,
    pub issuance_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebServerSettings {
    /// Bind address
    pub ip: IpAddr,
    pub port: u16,
    pub cert_filename: PathBuf,
    pub key_filename: PathBuf,
    /// Where to keep the CSR from the last regeneration
    pub csr_filename: Option<PathBuf>,
    /// Serve plain HTTP when false (behind a TLS-terminating proxy)
    pub tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            hostname: None,
            interface: None,
            public_ip: None,
            database_path: PathBuf::from("ots-cert.db"),
            dns: DnsSettings::default(),
            cloudflare: CloudflareSettings::default(),
            acme: AcmeSettings::default(),
            web_server: WebServerSettings::default(),
        }
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            provider: DnsProviderKind::Cloudflare,
            record_ttl: 120,
        }
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING.to_string(), // Staging for safety
            contact_email: None,
            propagation_delay_secs: 5,
            propagation_attempts: 3,
            propagation_interval_secs: 5,
            authorization_attempts: 3,
            authorization_interval_secs: 2,
            certificate_poll_attempts: 10,
            certificate_poll_interval_secs: 2,
            issuance_deadline_secs: 300,
        }
    }
}

impl Default for WebServerSettings {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([0, 0, 0, 0]),
            port: 443,
            cert_filename: PathBuf::from("server-cert.pem"),
            key_filename: PathBuf::from("server-key.pem"),
            csr_filename: None,
            tls: true,
        }
    }
}

impl AcmeSettings {
    pub fn validation_timing(&self) -> ValidationTiming {
        ValidationTiming {
            propagation_delay: Duration::from_secs(self.propagation_delay_secs),
            propagation: RetryPolicy::new(
                self.propagation_attempts,
                Duration::from_secs(self.propagation_interval_secs),
            ),
            authorization: RetryPolicy::new(
                self.authorization_attempts,
                Duration::from_secs(self.authorization_interval_secs),
            ),
            deadline: Duration::from_secs(self.issuance_deadline_secs),
        }
    }

    pub fn certificate_poll(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.certificate_poll_attempts,
            Duration::from_secs(self.certificate_poll_interval_secs),
        )
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(CLOUDFLARE_TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.cloudflare.api_token = Some(token);
        }
    }

    /// Fully-qualified name for a label under the configured domain
    pub fn fqdn(&self, label: &str) -> String {
        format!("{}.{}", label, self.domain.trim_end_matches('.'))
    }

    /// Copy safe to print: credentials replaced
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        let hide = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some(REDACTED.to_string());
            }
        };
        hide(&mut config.cloudflare.api_token);
        hide(&mut config.cloudflare.api_key);
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let domain = self.domain.trim_end_matches('.');
        if domain.is_empty() || !domain.contains('.') {
            anyhow::bail!("Invalid domain '{}': must be a registered domain name", self.domain);
        }

        if let Some(hostname) = &self.hostname {
            if !crate::names::is_valid_label(hostname) {
                anyhow::bail!("Invalid hostname '{}': must be a single DNS label", hostname);
            }
        }

        if self.web_server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        let acme = &self.acme;
        if acme.propagation_attempts == 0
            || acme.authorization_attempts == 0
            || acme.certificate_poll_attempts == 0
        {
            anyhow::bail!("Invalid ACME retry counts: every attempt count must be > 0");
        }
        if acme.issuance_deadline_secs <= acme.propagation_delay_secs {
            anyhow::bail!(
                "Invalid issuance_deadline_secs: must exceed propagation_delay_secs ({})",
                acme.propagation_delay_secs
            );
        }

        if self.dns.provider == DnsProviderKind::Cloudflare {
            let cf = &self.cloudflare;
            let has_token = cf.api_token.as_deref().is_some_and(|t| !t.is_empty());
            let has_key = cf.api_email.is_some() && cf.api_key.is_some();
            if !has_token && !has_key {
                anyhow::bail!(
                    "Cloudflare credentials missing: set cloudflare.api_token (or {}) or api_email + api_key",
                    CLOUDFLARE_TOKEN_ENV
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.cloudflare.api_token = Some("token".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.web_server.port, 443);
        assert_eq!(config.acme.propagation_attempts, 3);
        assert_eq!(config.acme.authorization_interval_secs, 2);
        assert_eq!(config.dns.provider, DnsProviderKind::Cloudflare);
        assert!(config.web_server.tls);
    }

    #[test]
    fn test_config_validation_succeeds() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_config_validation_requires_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dns.provider = DnsProviderKind::Memory;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.cloudflare.api_email = Some("ops@example.com".into());
        config.cloudflare.api_key = Some("key".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_failures() {
        let mut config = valid();
        config.web_server.port = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.domain = "localhost".into();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.acme.authorization_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.acme.issuance_deadline_secs = 5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.hostname = Some("Bad_Name".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            domain = "ots.example.org"
            interface = "eth0"

            [dns]
            provider = "memory"

            [acme]
            propagation_attempts = 5

            [web_server]
            port = 8443
            cert_filename = "/var/lib/ots/cert.pem"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.domain, "ots.example.org");
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.dns.provider, DnsProviderKind::Memory);
        assert_eq!(config.dns.record_ttl, 120);
        assert_eq!(config.acme.propagation_attempts, 5);
        assert_eq!(config.acme.authorization_attempts, 3);
        assert_eq!(config.web_server.port, 8443);
        assert_eq!(config.web_server.key_filename, PathBuf::from("server-key.pem"));
        assert_eq!(config.fqdn("eager-turing"), "eager-turing.ots.example.org");
    }

    #[test]
    fn test_env_override_and_redaction() {
        let mut config = Config::default();
        config.apply_overrides_from(|key| {
            (key == CLOUDFLARE_TOKEN_ENV).then(|| "from-env".to_string())
        });
        assert_eq!(config.cloudflare.api_token.as_deref(), Some("from-env"));

        let printed = toml::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("from-env"));
        assert!(printed.contains(REDACTED));
    }

    #[test]
    fn test_timing_from_settings() {
        let timing = AcmeSettings::default().validation_timing();
        assert_eq!(timing.propagation_delay, Duration::from_secs(5));
        assert_eq!(timing.propagation.attempts, 3);
        assert_eq!(timing.authorization.delay, Duration::from_secs(2));
        assert_eq!(timing.deadline, Duration::from_secs(300));
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let original = valid();
        original.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.domain, original.domain);
        assert_eq!(loaded.web_server.port, original.web_server.port);
    }
}
