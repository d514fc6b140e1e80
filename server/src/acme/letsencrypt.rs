//! Let's Encrypt (or any RFC 8555 CA) backend
//!
//! Every session registers a throwaway account with the terms of service
//! accepted, opens a single-identifier order and picks the DNS-01 challenge.
//! Nothing is stored between sessions.

use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AcmeSession, AuthorityError, AuthorizationState, CertificateAuthority};
use crate::retry::{RetryPolicy, Sleeper};

/// Let's Encrypt production ACME directory URL
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging ACME directory URL (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

impl From<instant_acme::Error> for AuthorityError {
    fn from(e: instant_acme::Error) -> Self {
        AuthorityError::Protocol(e.to_string())
    }
}

/// ACME directory client
pub struct LetsEncrypt {
    directory_url: String,
    contact_email: Option<String>,
    /// Bounds the wait for the signed certificate after finalization
    certificate_poll: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl LetsEncrypt {
    pub fn new(
        directory_url: &str,
        contact_email: Option<String>,
        certificate_poll: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            directory_url: directory_url.to_string(),
            contact_email,
            certificate_poll,
            sleeper,
        }
    }
}

struct LetsEncryptSession {
    domain: String,
    dns_value: String,
    order: Mutex<Order>,
    certificate_poll: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

#[async_trait]
impl CertificateAuthority for LetsEncrypt {
    async fn open(&self, domain: &str) -> Result<Box<dyn AcmeSession>, AuthorityError> {
        let contact = self.contact_email.as_ref().map(|e| format!("mailto:{}", e));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, _credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;
        debug!(directory = %self.directory_url, "Registered ACME account");

        // No notAfter: Let's Encrypt fixes the validity at 90 days itself
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut dns_value = None;
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut auth = result?;
                let status = auth.status;
                match status {
                    AuthorizationStatus::Pending => {
                        let challenge = auth
                            .challenge(ChallengeType::Dns01)
                            .ok_or_else(|| AuthorityError::NoDnsChallenge(domain.to_string()))?;
                        dns_value = Some(challenge.key_authorization().dns_value());
                    }
                    AuthorizationStatus::Valid => {
                        debug!(domain = %domain, "Authorization already valid");
                    }
                    status => {
                        return Err(AuthorityError::Protocol(format!(
                            "unexpected authorization status {:?} for {}",
                            status, domain
                        )));
                    }
                }
            }
        }

        let dns_value = dns_value.ok_or_else(|| {
            AuthorityError::Protocol(format!("no pending authorization for {}", domain))
        })?;

        info!(domain = %domain, "ACME order opened with DNS-01 challenge");
        Ok(Box::new(LetsEncryptSession {
            domain: domain.to_string(),
            dns_value,
            order: Mutex::new(order),
            certificate_poll: self.certificate_poll,
            sleeper: self.sleeper.clone(),
        }))
    }
}

#[async_trait]
impl AcmeSession for LetsEncryptSession {
    fn dns_value(&self) -> &str {
        &self.dns_value
    }

    async fn accept(&self) -> Result<(), AuthorityError> {
        let mut order = self.order.lock().await;
        let mut authorizations = order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut auth = result?;
            if !matches!(auth.status, AuthorizationStatus::Pending) {
                continue;
            }

            let mut challenge = auth
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AuthorityError::NoDnsChallenge(self.domain.clone()))?;
            challenge.set_ready().await?;
            debug!(domain = %self.domain, "DNS-01 challenge set ready");
        }

        Ok(())
    }

    async fn authorization_status(&self) -> Result<AuthorizationState, AuthorityError> {
        let mut order = self.order.lock().await;
        let state = order.refresh().await?;

        Ok(match state.status {
            OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => {
                AuthorizationState::Authorized
            }
            OrderStatus::Pending => AuthorizationState::Pending,
            OrderStatus::Invalid => AuthorizationState::Invalid,
        })
    }

    async fn issue(&self, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AuthorityError> {
        {
            let mut order = self.order.lock().await;
            order.finalize_csr(csr_der).await?;
        }
        debug!(domain = %self.domain, "Order finalized, waiting for certificate");

        let order = &self.order;
        let domain = self.domain.as_str();
        let chain_pem = self
            .certificate_poll
            .poll(self.sleeper.as_ref(), move |attempt| async move {
                let mut order = order.lock().await;
                match order.certificate().await {
                    Ok(Some(pem)) => Some(pem),
                    Ok(None) => {
                        debug!(domain = %domain, attempt, "Certificate not ready yet");
                        None
                    }
                    Err(e) => {
                        warn!(domain = %domain, attempt, error = %e, "Error fetching certificate");
                        None
                    }
                }
            })
            .await
            .ok_or_else(|| {
                AuthorityError::Protocol(format!(
                    "certificate for {} not available after {} attempts",
                    self.domain, self.certificate_poll.attempts
                ))
            })?;

        pem_chain_to_der(&chain_pem)
    }
}

/// Split a PEM chain into DER certificates, preserving order
pub fn pem_chain_to_der(chain_pem: &str) -> Result<Vec<Vec<u8>>, AuthorityError> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|e| AuthorityError::Protocol(format!("malformed certificate chain: {}", e)))?;

    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect())
}
