//! Domain validation and certificate issuance
//!
//! Obtains CA-signed certificates for CSRs by proving control of the domain
//! through a DNS-01 challenge:
//!
//! ```text
//! open session ─▶ publish TXT proof ─▶ wait + poll visibility ─▶ accept
//!      ─▶ poll authorization ─▶ submit CSR ─▶ chain (DER) ─▶ delete TXT proof
//! ```
//!
//! The ACME protocol itself sits behind [`CertificateAuthority`] so the flow
//! can be driven against a test CA. Every wait is a bounded
//! [`RetryPolicy`], the whole attempt runs under one deadline, and at most
//! one attempt per domain runs at a time.

pub mod letsencrypt;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dns::{challenge_record_name, DnsError, DnsRecordManager, RecordType};
use crate::retry::{RetryPolicy, Sleeper};

pub use letsencrypt::{LetsEncrypt, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};

/// Errors reported by a certificate authority backend
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("No DNS-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("ACME protocol error: {0}")]
    Protocol(String),
}

/// Authorization state as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Pending,
    Authorized,
    Invalid,
}

/// One in-progress order with a certificate authority.
///
/// Created by [`CertificateAuthority::open`] with a DNS-01 challenge already
/// selected for the domain.
#[async_trait]
pub trait AcmeSession: Send + Sync {
    /// Value to publish in the `_acme-challenge` TXT record
    fn dns_value(&self) -> &str;

    /// Tell the CA the proof is in place
    async fn accept(&self) -> Result<(), AuthorityError>;

    /// Current authorization state for the domain
    async fn authorization_status(&self) -> Result<AuthorizationState, AuthorityError>;

    /// Submit a DER-encoded CSR and return the issued chain, leaf first
    async fn issue(&self, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AuthorityError>;
}

/// An ACME certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Register an account, request authorization for `domain` and select
    /// its DNS-01 challenge
    async fn open(&self, domain: &str) -> Result<Box<dyn AcmeSession>, AuthorityError>;
}

/// Anything that can turn a CSR for a domain into a signed chain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, ValidationError>;
}

/// Domain validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Failed to start validation for {domain}: {source}")]
    Setup {
        domain: String,
        #[source]
        source: AuthorityError,
    },

    #[error("No DNS-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("Failed to publish challenge proof {record}: {source}")]
    ProofPublication {
        record: String,
        #[source]
        source: DnsError,
    },

    #[error("Challenge record {record} not visible after {attempts} checks")]
    ChallengePublicationTimeout { record: String, attempts: u32 },

    #[error("CA rejected the challenge for {domain}: {reason}")]
    ChallengeRejected { domain: String, reason: String },

    #[error("Authorization for {0} became invalid")]
    AuthorizationInvalid(String),

    #[error("Authorization for {domain} not granted after {attempts} checks")]
    AuthorizationTimeout { domain: String, attempts: u32 },

    #[error("Certificate issuance for {domain} failed: {reason}")]
    IssuanceError { domain: String, reason: String },

    #[error("Certificate issuance for {0} is already in progress")]
    IssuanceInProgress(String),

    #[error("Certificate issuance for {domain} exceeded the {secs}s deadline")]
    DeadlineExceeded { domain: String, secs: u64 },
}

/// Challenge session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    ProofPublished,
    ProofVisible,
    Submitted,
    Authorized,
    Failed,
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeState::Authorized | ChallengeState::Failed)
    }

    /// Whether `self → next` is a legal step
    pub fn can_advance_to(&self, next: ChallengeState) -> bool {
        use ChallengeState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (ProofPublished, ProofVisible) => true,
            (ProofVisible, Submitted) => true,
            (Submitted, Authorized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeState::ProofPublished => "proof-published",
            ChallengeState::ProofVisible => "proof-visible",
            ChallengeState::Submitted => "submitted",
            ChallengeState::Authorized => "authorized",
            ChallengeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-attempt challenge state. Never persisted.
#[derive(Debug)]
pub struct ChallengeSession {
    pub domain: String,
    pub proof_label: String,
    pub proof_value: String,
    state: ChallengeState,
}

impl ChallengeSession {
    fn published(domain: &str, proof_label: String, proof_value: String) -> Self {
        debug!(domain = %domain, record = %proof_label, "Challenge proof published");
        Self {
            domain: domain.to_string(),
            proof_label,
            proof_value,
            state: ChallengeState::ProofPublished,
        }
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    fn advance(&mut self, next: ChallengeState) {
        if !self.state.can_advance_to(next) {
            warn!(domain = %self.domain, from = %self.state, to = %next, "Unexpected challenge transition");
        }
        debug!(domain = %self.domain, from = %self.state, to = %next, "Challenge state changed");
        self.state = next;
    }

    fn fail(&mut self, err: ValidationError) -> ValidationError {
        self.advance(ChallengeState::Failed);
        err
    }
}

/// Timing knobs for one validation attempt
#[derive(Debug, Clone, Copy)]
pub struct ValidationTiming {
    /// Wait between publishing the proof and the first visibility check
    pub propagation_delay: Duration,
    pub propagation: RetryPolicy,
    pub authorization: RetryPolicy,
    /// Overall budget for one attempt
    pub deadline: Duration,
}

impl Default for ValidationTiming {
    fn default() -> Self {
        Self {
            propagation_delay: Duration::from_secs(5),
            propagation: RetryPolicy::new(3, Duration::from_secs(5)),
            authorization: RetryPolicy::new(3, Duration::from_secs(2)),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Drives DNS-01 validation and issuance against a [`CertificateAuthority`]
pub struct DomainValidator {
    authority: Arc<dyn CertificateAuthority>,
    dns: DnsRecordManager,
    sleeper: Arc<dyn Sleeper>,
    timing: ValidationTiming,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases a domain's in-flight slot when dropped
struct InFlight<'a> {
    domains: &'a Mutex<HashSet<String>>,
    domain: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut domains = match self.domains.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        domains.remove(&self.domain);
    }
}

impl DomainValidator {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        dns: DnsRecordManager,
        sleeper: Arc<dyn Sleeper>,
        timing: ValidationTiming,
    ) -> Self {
        Self {
            authority,
            dns,
            sleeper,
            timing,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, domain: &str) -> Result<InFlight<'_>, ValidationError> {
        let mut domains = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("In-flight domain set poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if !domains.insert(domain.to_string()) {
            return Err(ValidationError::IssuanceInProgress(domain.to_string()));
        }

        Ok(InFlight {
            domains: &self.in_flight,
            domain: domain.to_string(),
        })
    }

    /// Prove control of `domain` and have the CA sign `csr_der`.
    ///
    /// Returns the chain as DER certificates, leaf first. The challenge TXT
    /// record is removed afterwards whatever the outcome.
    pub async fn obtain_certificate(
        &self,
        domain: &str,
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>, ValidationError> {
        let _slot = self.claim(domain)?;
        let record = challenge_record_name(domain);

        info!(domain = %domain, "Starting DNS-01 validation");
        let outcome = match tokio::time::timeout(
            self.timing.deadline,
            self.validate_and_issue(domain, &record, csr_der),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ValidationError::DeadlineExceeded {
                domain: domain.to_string(),
                secs: self.timing.deadline.as_secs(),
            }),
        };

        if let Err(e) = self.dns.delete(RecordType::Txt, &record).await {
            warn!(record = %record, error = %e, "Failed to remove challenge record");
        }

        match &outcome {
            Ok(chain) => info!(domain = %domain, certificates = chain.len(), "Certificate issued"),
            Err(e) => error!(domain = %domain, error = %e, "Certificate issuance failed"),
        }
        outcome
    }

    async fn validate_and_issue(
        &self,
        domain: &str,
        record: &str,
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>, ValidationError> {
        let order = self.authority.open(domain).await.map_err(|e| match e {
            AuthorityError::NoDnsChallenge(d) => ValidationError::NoDnsChallenge(d),
            other => ValidationError::Setup {
                domain: domain.to_string(),
                source: other,
            },
        })?;

        self.dns
            .reconcile(RecordType::Txt, record, order.dns_value())
            .await
            .map_err(|e| ValidationError::ProofPublication {
                record: record.to_string(),
                source: e,
            })?;
        let mut session =
            ChallengeSession::published(domain, record.to_string(), order.dns_value().to_string());

        self.sleeper.sleep(self.timing.propagation_delay).await;

        let dns = &self.dns;
        let visible = self
            .timing
            .propagation
            .poll(self.sleeper.as_ref(), move |attempt| async move {
                debug!(record = %record, attempt, "Checking challenge record visibility");
                dns.exists(RecordType::Txt, record).await.then_some(())
            })
            .await;
        if visible.is_none() {
            return Err(session.fail(ValidationError::ChallengePublicationTimeout {
                record: record.to_string(),
                attempts: self.timing.propagation.attempts,
            }));
        }
        session.advance(ChallengeState::ProofVisible);

        if let Err(e) = order.accept().await {
            return Err(session.fail(ValidationError::ChallengeRejected {
                domain: domain.to_string(),
                reason: e.to_string(),
            }));
        }
        session.advance(ChallengeState::Submitted);

        let order_ref: &dyn AcmeSession = &*order;
        let authorized = self
            .timing
            .authorization
            .poll(self.sleeper.as_ref(), move |attempt| async move {
                match order_ref.authorization_status().await {
                    Ok(AuthorizationState::Authorized) => Some(true),
                    Ok(AuthorizationState::Invalid) => Some(false),
                    Ok(AuthorizationState::Pending) => {
                        debug!(domain = %domain, attempt, "Authorization still pending");
                        None
                    }
                    Err(e) => {
                        warn!(domain = %domain, attempt, error = %e, "Authorization status check failed");
                        None
                    }
                }
            })
            .await;
        match authorized {
            Some(true) => session.advance(ChallengeState::Authorized),
            Some(false) => {
                return Err(session.fail(ValidationError::AuthorizationInvalid(domain.to_string())))
            }
            None => {
                return Err(session.fail(ValidationError::AuthorizationTimeout {
                    domain: domain.to_string(),
                    attempts: self.timing.authorization.attempts,
                }))
            }
        }

        let chain = order
            .issue(csr_der)
            .await
            .map_err(|e| ValidationError::IssuanceError {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        if chain.is_empty() {
            return Err(ValidationError::IssuanceError {
                domain: domain.to_string(),
                reason: "CA returned no certificates".to_string(),
            });
        }

        Ok(chain)
    }
}

#[async_trait]
impl CertificateIssuer for DomainValidator {
    async fn issue(&self, domain: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, ValidationError> {
        self.obtain_certificate(domain, csr_der).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::InMemoryZone;
    use crate::retry::TokioSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct CountingSleeper {
        sleeps: AtomicU32,
    }

    #[async_trait]
    impl Sleeper for CountingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scripted CA: fixed proof value, authorization answers in order, then
    /// `Authorized` forever
    struct ScriptedAuthority {
        statuses: Vec<AuthorizationState>,
        reject_accept: bool,
        offers_dns_challenge: bool,
        chain: Vec<Vec<u8>>,
    }

    struct ScriptedSession {
        statuses: Vec<AuthorizationState>,
        polls: AtomicU32,
        reject_accept: bool,
        chain: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl AcmeSession for ScriptedSession {
        fn dns_value(&self) -> &str {
            "proof-value"
        }

        async fn accept(&self) -> Result<(), AuthorityError> {
            if self.reject_accept {
                return Err(AuthorityError::Protocol("challenge already used".into()));
            }
            Ok(())
        }

        async fn authorization_status(&self) -> Result<AuthorizationState, AuthorityError> {
            let i = self.polls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self
                .statuses
                .get(i)
                .copied()
                .unwrap_or(AuthorizationState::Authorized))
        }

        async fn issue(&self, _csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AuthorityError> {
            Ok(self.chain.clone())
        }
    }

    #[async_trait]
    impl CertificateAuthority for ScriptedAuthority {
        async fn open(&self, domain: &str) -> Result<Box<dyn AcmeSession>, AuthorityError> {
            if !self.offers_dns_challenge {
                return Err(AuthorityError::NoDnsChallenge(domain.to_string()));
            }
            Ok(Box::new(ScriptedSession {
                statuses: self.statuses.clone(),
                polls: AtomicU32::new(0),
                reject_accept: self.reject_accept,
                chain: self.chain.clone(),
            }))
        }
    }

    fn authority(statuses: Vec<AuthorizationState>) -> ScriptedAuthority {
        ScriptedAuthority {
            statuses,
            reject_accept: false,
            offers_dns_challenge: true,
            chain: vec![vec![1, 2, 3]],
        }
    }

    fn validator(
        authority: ScriptedAuthority,
    ) -> (Arc<InMemoryZone>, Arc<CountingSleeper>, DomainValidator) {
        let zone = Arc::new(InMemoryZone::new());
        let sleeper = Arc::new(CountingSleeper::default());
        let validator = DomainValidator::new(
            Arc::new(authority),
            DnsRecordManager::new(zone.clone()),
            sleeper.clone(),
            ValidationTiming::default(),
        );
        (zone, sleeper, validator)
    }

    #[tokio::test]
    async fn test_successful_issuance_cleans_up_proof() {
        let (zone, sleeper, validator) = validator(authority(vec![
            AuthorizationState::Pending,
            AuthorizationState::Authorized,
        ]));

        let chain = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap();
        assert_eq!(chain, vec![vec![1, 2, 3]]);
        assert!(zone.records().await.is_empty());

        // propagation delay + one authorization retry
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_authorization_timeout() {
        let (zone, _, validator) = validator(authority(vec![AuthorizationState::Pending; 10]));

        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::AuthorizationTimeout { attempts: 3, .. }));
        assert!(zone.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_authorization_stops_polling() {
        let (_, sleeper, validator) = validator(authority(vec![AuthorizationState::Invalid]));

        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::AuthorizationInvalid(_)));
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_challenge() {
        let mut scripted = authority(vec![]);
        scripted.reject_accept = true;
        let (_, _, validator) = validator(scripted);

        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::ChallengeRejected { .. }));
    }

    #[tokio::test]
    async fn test_empty_chain_is_an_error() {
        let mut scripted = authority(vec![]);
        scripted.chain = Vec::new();
        let (_, _, validator) = validator(scripted);

        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::IssuanceError { .. }));
    }

    #[tokio::test]
    async fn test_missing_dns_challenge() {
        let mut scripted = authority(vec![]);
        scripted.offers_dns_challenge = false;
        let (zone, sleeper, validator) = validator(scripted);

        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::NoDnsChallenge(ref d) if d == "host.example.com"));
        assert!(zone.records().await.is_empty());
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_cuts_off_slow_propagation() {
        let zone = Arc::new(InMemoryZone::new());
        let validator = DomainValidator::new(
            Arc::new(authority(vec![])),
            DnsRecordManager::new(zone.clone()),
            Arc::new(TokioSleeper),
            ValidationTiming {
                propagation_delay: Duration::from_secs(30),
                deadline: Duration::from_millis(50),
                ..ValidationTiming::default()
            },
        );

        let started = Instant::now();
        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::DeadlineExceeded { ref domain, .. } if domain == "host.example.com"));
        assert!(started.elapsed() < Duration::from_secs(10));

        // The proof published before the deadline is gone
        assert!(zone.records().await.is_empty());
        // and the domain can be attempted again
        assert!(validator.claim("host.example.com").is_ok());
    }

    #[tokio::test]
    async fn test_same_domain_is_exclusive() {
        let (_, _, validator) = validator(authority(vec![]));

        let slot = validator.claim("host.example.com").unwrap();
        let err = validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::IssuanceInProgress(_)));

        // Other domains are unaffected
        validator
            .obtain_certificate("other.example.com", b"csr")
            .await
            .unwrap();

        drop(slot);
        validator
            .obtain_certificate("host.example.com", b"csr")
            .await
            .unwrap();
    }

    #[test]
    fn test_challenge_state_transitions() {
        use ChallengeState::*;
        assert!(ProofPublished.can_advance_to(ProofVisible));
        assert!(ProofVisible.can_advance_to(Submitted));
        assert!(Submitted.can_advance_to(Authorized));
        assert!(Submitted.can_advance_to(Failed));
        assert!(!ProofPublished.can_advance_to(Submitted));
        assert!(!Authorized.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(ProofVisible));
        assert!(Authorized.is_terminal() && Failed.is_terminal());
        assert_eq!(ProofVisible.to_string(), "proof-visible");
    }
}
