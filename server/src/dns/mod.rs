//! DNS record management
//!
//! Typed record reconciliation against a single remote zone.
//!
//! ## Architecture
//!
//! ```text
//! Provisioning → DnsRecordManager → ZoneProvider ─┬─ CloudflareZone (HTTPS API)
//!   (A records,     (reconcile /        (seam)     └─ InMemoryZone   (dev, tests)
//!    TXT proofs)     exists / delete)
//! ```
//!
//! ## Components
//!
//! - `types`: record type, record and error definitions
//! - `provider`: the zone provider capability trait
//! - `cloudflare`: Cloudflare v4 API provider
//! - `memory`: in-process provider
//! - `manager`: idempotent create-or-update, existence polling, idempotent delete

pub mod cloudflare;
pub mod manager;
pub mod memory;
pub mod provider;
pub mod types;

pub use cloudflare::{CloudflareAuth, CloudflareZone};
pub use manager::DnsRecordManager;
pub use memory::InMemoryZone;
pub use provider::ZoneProvider;
pub use types::{DnsError, DnsRecord, DnsResult, RecordType};

/// Label prefix under which DNS-01 proofs are published
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Full name of the DNS-01 proof record for `domain`
pub fn challenge_record_name(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_LABEL, domain.trim_end_matches('.'))
}
