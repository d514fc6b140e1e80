//! Certificate lifecycle
//!
//! Decides whether the certificate on disk can be reused for a hostname and
//! otherwise runs a fresh key → CSR → issuance cycle. Reuse is all or
//! nothing: any problem with the stored pair regenerates both files.
//!
//! ## Security Notes
//! - Private keys are written with 0600 permissions (owner read/write only)
//! - Keys are ECDSA P-256
//! - Nothing is written until the CA has returned a chain, so a failed
//!   issuance never clobbers a working pair; the new key and chain are
//!   staged and then renamed into place together

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::acme::{CertificateIssuer, ValidationError};

/// Certificate lifecycle errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Key or CSR generation failed: {0}")]
    KeyGeneration(String),

    #[error("Failed to write {path}: {source}")]
    PersistenceError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Issuance(#[from] ValidationError),
}

impl From<rcgen::Error> for CertError {
    fn from(e: rcgen::Error) -> Self {
        CertError::KeyGeneration(e.to_string())
    }
}

/// Freshly generated key pair and signing request
pub struct KeyAndCsr {
    /// PKCS#8 private key, PEM encoded
    pub key_pem: String,
    pub csr_der: Vec<u8>,
    pub csr_pem: String,
}

impl fmt::Debug for KeyAndCsr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAndCsr")
            .field("key_pem", &"<redacted>")
            .field("csr_der", &format_args!("{} bytes", self.csr_der.len()))
            .finish()
    }
}

/// Generate an ECDSA P-256 key and a CSR for `fqdn` (CN and SAN)
pub fn generate_key_and_csr(fqdn: &str) -> Result<KeyAndCsr, CertError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![fqdn.to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, fqdn);
    params.distinguished_name = name;

    let csr = params.serialize_request(&key_pair)?;
    let csr_pem = csr.pem()?;

    Ok(KeyAndCsr {
        key_pem: key_pair.serialize_pem(),
        csr_der: csr.der().to_vec(),
        csr_pem,
    })
}

/// Concatenate DER certificates into PEM `CERTIFICATE` blocks, in order
pub fn encode_chain_pem(chain: &[Vec<u8>]) -> String {
    let blocks: Vec<pem::Pem> = chain
        .iter()
        .map(|der| pem::Pem::new("CERTIFICATE", der.clone()))
        .collect();
    pem::encode_many_config(
        &blocks,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Write a private key, restricting it to the owner on Unix
pub async fn write_private_key(path: &Path, key_pem: &str) -> Result<(), CertError> {
    write_file(path, key_pem.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .await
            .map_err(|source| CertError::PersistenceError {
                path: path.to_path_buf(),
                source,
            })?;
    }

    Ok(())
}

/// Write `contents`, creating parent directories as needed
pub async fn write_file(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let persist = |source| CertError::PersistenceError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(persist)?;
    }
    fs::write(path, contents).await.map_err(persist)
}

/// Sibling of `path` that a write is staged in before being renamed over it
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn rename(from: &Path, to: &Path) -> Result<(), CertError> {
    fs::rename(from, to)
        .await
        .map_err(|source| CertError::PersistenceError {
            path: to.to_path_buf(),
            source,
        })
}

/// Replace a key and its chain together.
///
/// Both are staged next to their targets first; the stored pair is only
/// touched once both staged files are complete.
pub async fn write_key_and_chain(
    key_path: &Path,
    key_pem: &str,
    cert_path: &Path,
    chain_pem: &str,
) -> Result<(), CertError> {
    let staged_key = staging_path(key_path);
    let staged_cert = staging_path(cert_path);

    write_private_key(&staged_key, key_pem).await?;
    if let Err(e) = write_file(&staged_cert, chain_pem.as_bytes()).await {
        let _ = fs::remove_file(&staged_key).await;
        return Err(e);
    }

    if let Err(e) = rename(&staged_key, key_path).await {
        let _ = fs::remove_file(&staged_key).await;
        let _ = fs::remove_file(&staged_cert).await;
        return Err(e);
    }
    if let Err(e) = rename(&staged_cert, cert_path).await {
        let _ = fs::remove_file(&staged_cert).await;
        return Err(e);
    }

    Ok(())
}

/// Outcome of inspecting a stored certificate/key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// One or both files do not exist
    Missing { cert: bool, key: bool },
    /// The files exist but could not be read or parsed
    Unreadable(String),
    /// `not_after` (Unix seconds) is not in the future
    Expired { not_after: i64 },
    /// The leaf's SAN list does not contain the hostname
    NameMismatch { names: Vec<String> },
    Valid { not_after: i64 },
}

impl CertificateStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CertificateStatus::Valid { .. })
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateStatus::Missing { cert, key } => {
                let mut missing = Vec::new();
                if *cert {
                    missing.push("certificate");
                }
                if *key {
                    missing.push("key");
                }
                write!(f, "missing {}", missing.join(" and "))
            }
            CertificateStatus::Unreadable(reason) => write!(f, "unreadable: {}", reason),
            CertificateStatus::Expired { not_after } => write!(f, "expired at {}", not_after),
            CertificateStatus::NameMismatch { names } => {
                write!(f, "issued for [{}]", names.join(", "))
            }
            CertificateStatus::Valid { not_after } => write!(f, "valid until {}", not_after),
        }
    }
}

/// Leaf expiry and DNS SANs of the first certificate in a PEM file
fn leaf_details(cert_pem: &[u8]) -> Result<(i64, Vec<String>), String> {
    let blocks = pem::parse_many(cert_pem).map_err(|e| format!("invalid PEM: {}", e))?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| "no CERTIFICATE block".to_string())?;

    let (_, cert) =
        parse_x509_certificate(leaf.contents()).map_err(|e| format!("invalid X.509: {}", e))?;

    let not_after = cert.validity().not_after.timestamp();
    let names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => return Err(format!("invalid subjectAltName: {}", e)),
    };

    Ok((not_after, names))
}

/// Reuse-or-regenerate policy for one certificate/key pair on disk
pub struct CertificateManager {
    issuer: Arc<dyn CertificateIssuer>,
}

impl CertificateManager {
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self { issuer }
    }

    /// Classify the pair at `cert_path`/`key_path` for `fqdn`
    pub async fn inspect(&self, fqdn: &str, cert_path: &Path, key_path: &Path) -> CertificateStatus {
        let cert_missing = !fs::try_exists(cert_path).await.unwrap_or(false);
        let key_missing = !fs::try_exists(key_path).await.unwrap_or(false);
        if cert_missing || key_missing {
            return CertificateStatus::Missing {
                cert: cert_missing,
                key: key_missing,
            };
        }

        let cert_pem = match fs::read(cert_path).await {
            Ok(bytes) => bytes,
            Err(e) => return CertificateStatus::Unreadable(format!("certificate: {}", e)),
        };
        let key_pem = match fs::read(key_path).await {
            Ok(bytes) => bytes,
            Err(e) => return CertificateStatus::Unreadable(format!("key: {}", e)),
        };

        match rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice())) {
            Ok(Some(_)) => {}
            Ok(None) => return CertificateStatus::Unreadable("key: no private key found".into()),
            Err(e) => return CertificateStatus::Unreadable(format!("key: {}", e)),
        }

        let (not_after, names) = match leaf_details(&cert_pem) {
            Ok(details) => details,
            Err(reason) => return CertificateStatus::Unreadable(format!("certificate: {}", reason)),
        };

        if not_after <= chrono::Utc::now().timestamp() {
            return CertificateStatus::Expired { not_after };
        }
        if !names.iter().any(|name| name == fqdn) {
            return CertificateStatus::NameMismatch { names };
        }

        CertificateStatus::Valid { not_after }
    }

    /// Return a usable PEM chain for `fqdn`, issuing a new one if needed.
    ///
    /// When a new pair is generated the key is written to `key_path`, the
    /// chain to `cert_path`, and the CSR to `csr_path` if given.
    pub async fn ensure_certificate(
        &self,
        fqdn: &str,
        cert_path: &Path,
        key_path: &Path,
        csr_path: Option<&Path>,
    ) -> Result<Vec<u8>, CertError> {
        let status = self.inspect(fqdn, cert_path, key_path).await;
        if status.is_valid() {
            info!(domain = %fqdn, path = %cert_path.display(), %status, "Reusing existing certificate");
            return fs::read(cert_path)
                .await
                .map_err(|source| CertError::PersistenceError {
                    path: cert_path.to_path_buf(),
                    source,
                });
        }

        match &status {
            CertificateStatus::Missing { .. } => {
                info!(domain = %fqdn, %status, "No certificate yet, requesting one")
            }
            _ => warn!(domain = %fqdn, %status, "Stored certificate unusable, regenerating"),
        }

        let request = generate_key_and_csr(fqdn)?;
        debug!(domain = %fqdn, csr_bytes = request.csr_der.len(), "Generated key and CSR");

        let chain = self.issuer.issue(fqdn, &request.csr_der).await?;
        let chain_pem = encode_chain_pem(&chain);

        write_key_and_chain(key_path, &request.key_pem, cert_path, &chain_pem).await?;
        if let Some(csr_path) = csr_path {
            write_file(csr_path, request.csr_pem.as_bytes()).await?;
        }

        info!(
            domain = %fqdn,
            cert = %cert_path.display(),
            key = %key_path.display(),
            certificates = chain.len(),
            "Certificate and key saved"
        );
        Ok(chain_pem.into_bytes())
    }
}
