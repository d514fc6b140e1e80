use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::errors::ClientError;

/// Configuration for the OTS certificate client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the certificate server
    pub server_url: String,
    /// Overrides `<server_url>/register`
    pub registration_url: Option<String>,
    /// Overrides `<server_url>/get_certificate`
    pub certificate_request_url: Option<String>,
    /// Extra root certificate (PEM) to trust for the server, e.g. a staging CA
    pub ca_certificate: Option<PathBuf>,
    /// Interface to take the local address from
    pub interface: Option<String>,
    /// Address to register, skips interface discovery
    pub ip: Option<Ipv4Addr>,
    pub cert_filename: PathBuf,
    pub key_filename: PathBuf,
    pub csr_filename: Option<PathBuf>,
    pub web_server: WebServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebServer {
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://ots.example.com".to_string(),
            registration_url: None,
            certificate_request_url: None,
            ca_certificate: None,
            interface: None,
            ip: None,
            cert_filename: PathBuf::from("client-cert.pem"),
            key_filename: PathBuf::from("client-key.pem"),
            csr_filename: None,
            web_server: WebServer::default(),
        }
    }
}

impl Default for WebServer {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

impl Config {
    /// Load config from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn registration_url(&self) -> String {
        self.registration_url
            .clone()
            .unwrap_or_else(|| format!("{}/register", self.server_url.trim_end_matches('/')))
    }

    pub fn certificate_request_url(&self) -> String {
        self.certificate_request_url
            .clone()
            .unwrap_or_else(|| format!("{}/get_certificate", self.server_url.trim_end_matches('/')))
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        for url in [self.registration_url(), self.certificate_request_url()] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ClientError::ConfigError(format!(
                    "'{}' is not an http(s) URL",
                    url
                )));
            }
        }

        if self.web_server.port == 0 {
            return Err(ClientError::ConfigError("web_server.port cannot be 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_urls() {
        let mut config = Config::default();
        config.server_url = "https://ots.example.org/".to_string();
        assert_eq!(config.registration_url(), "https://ots.example.org/register");
        assert_eq!(
            config.certificate_request_url(),
            "https://ots.example.org/get_certificate"
        );

        config.registration_url = Some("https://other.example.org/signup".to_string());
        assert_eq!(config.registration_url(), "https://other.example.org/signup");
    }

    #[test]
    fn test_validation() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.server_url = "ftp://ots.example.org".to_string();
        assert!(matches!(config.validate(), Err(ClientError::ConfigError(_))));

        let mut config = Config::default();
        config.web_server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            r#"
                server_url = "https://eager-turing.example.com"
                ip = "10.0.0.5"

                [web_server]
                port = 9443
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(config.web_server.port, 9443);
        assert_eq!(config.key_filename, PathBuf::from("client-key.pem"));

        let missing = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(missing.server_url, Config::default().server_url);
    }
}
