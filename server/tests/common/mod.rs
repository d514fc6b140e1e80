//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, IsCa,
    KeyPair,
};
use rustls::pki_types::CertificateSigningRequestDer;

use ots_cert_server::acme::{
    AcmeSession, AuthorityError, AuthorizationState, CertificateAuthority, DomainValidator,
    ValidationTiming,
};
use ots_cert_server::dns::{DnsRecord, DnsRecordManager, DnsResult, InMemoryZone, RecordType, ZoneProvider};
use ots_cert_server::names::NameGenerator;
use ots_cert_server::retry::{RetryPolicy, Sleeper};

/// Sleeper that returns immediately and counts calls
#[derive(Default)]
pub struct InstantSleeper {
    pub sleeps: AtomicU32,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}

/// Replays a fixed list of candidates, then falls back to `fallback-N`
pub struct ScriptedNames {
    queue: Mutex<VecDeque<String>>,
    fallback: AtomicU32,
}

impl ScriptedNames {
    pub fn new(candidates: &[&str]) -> Self {
        Self {
            queue: Mutex::new(candidates.iter().map(|c| c.to_string()).collect()),
            fallback: AtomicU32::new(0),
        }
    }
}

impl NameGenerator for ScriptedNames {
    fn candidate(&self) -> String {
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        format!("fallback-{}", self.fallback.fetch_add(1, Ordering::SeqCst))
    }
}

/// Generator where every other candidate repeats the previous one
pub struct CollidingNames {
    counter: AtomicU32,
}

impl CollidingNames {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }
}

impl NameGenerator for CollidingNames {
    fn candidate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("host-{}", n / 2)
    }
}

/// Zone that stores records but never reports TXT records as present
#[derive(Debug, Default)]
pub struct HiddenTxtZone {
    pub inner: InMemoryZone,
    pub txt_lookups: AtomicU32,
}

#[async_trait]
impl ZoneProvider for HiddenTxtZone {
    fn name(&self) -> &'static str {
        "hidden-txt"
    }

    async fn find_records(&self, record_type: RecordType, name: &str) -> DnsResult<Vec<DnsRecord>> {
        if record_type == RecordType::Txt {
            self.txt_lookups.fetch_add(1, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        self.inner.find_records(record_type, name).await
    }

    async fn create_record(
        &self,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        self.inner.create_record(record_type, name, content).await
    }

    async fn update_record(
        &self,
        id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        self.inner.update_record(id, record_type, name, content).await
    }

    async fn delete_record(&self, id: &str) -> DnsResult<()> {
        self.inner.delete_record(id).await
    }
}

/// A throwaway CA that signs CSRs once authorization succeeds
pub struct TestCa {
    key: KeyPair,
    cert: Certificate,
    pub orders: AtomicU32,
}

impl TestCa {
    pub fn new() -> Arc<Self> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Arc::new(Self {
            key,
            cert,
            orders: AtomicU32::new(0),
        })
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    fn sign(&self, domain: &str, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AuthorityError> {
        let der = CertificateSigningRequestDer::from(csr_der.to_vec());
        let csr = CertificateSigningRequestParams::from_der(&der)
            .map_err(|e| AuthorityError::Protocol(format!("bad CSR: {}", e)))?;
        let leaf = CertificateParams::new(vec![domain.to_string()])
            .and_then(|params| params.signed_by(&csr.public_key, &self.cert, &self.key))
            .map_err(|e| AuthorityError::Protocol(e.to_string()))?;
        Ok(vec![leaf.der().to_vec(), self.root_der()])
    }
}

struct TestOrder {
    ca: Arc<TestCa>,
    domain: String,
}

#[async_trait]
impl AcmeSession for TestOrder {
    fn dns_value(&self) -> &str {
        "test-ca-proof"
    }

    async fn accept(&self) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn authorization_status(&self) -> Result<AuthorizationState, AuthorityError> {
        Ok(AuthorizationState::Authorized)
    }

    async fn issue(&self, csr_der: &[u8]) -> Result<Vec<Vec<u8>>, AuthorityError> {
        self.ca.sign(&self.domain, csr_der)
    }
}

/// Hands out orders signed by a shared [`TestCa`]
pub struct TestAuthority(pub Arc<TestCa>);

#[async_trait]
impl CertificateAuthority for TestAuthority {
    async fn open(&self, domain: &str) -> Result<Box<dyn AcmeSession>, AuthorityError> {
        self.0.orders.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestOrder {
            ca: self.0.clone(),
            domain: domain.to_string(),
        }))
    }
}

pub fn fast_timing() -> ValidationTiming {
    ValidationTiming {
        propagation_delay: Duration::from_millis(1),
        propagation: RetryPolicy::new(3, Duration::from_millis(1)),
        authorization: RetryPolicy::new(3, Duration::from_millis(1)),
        deadline: Duration::from_secs(10),
    }
}

pub fn validator(
    ca: Arc<TestCa>,
    dns: DnsRecordManager,
    sleeper: Arc<InstantSleeper>,
) -> Arc<DomainValidator> {
    Arc::new(DomainValidator::new(
        Arc::new(TestAuthority(ca)),
        dns,
        sleeper,
        fast_timing(),
    ))
}
