//! DNS Record Type Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Record types the provisioning flow manages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// Text record (DNS-01 proofs)
    Txt,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "TXT" => Ok(RecordType::Txt),
            _ => Err(DnsError::UnsupportedRecordType(s.to_string())),
        }
    }
}

/// A record as seen in the remote zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Provider-assigned handle, only valid for the current operation
    pub id: String,
    pub record_type: RecordType,
    /// Fully-qualified name
    pub name: String,
    pub content: String,
}

/// DNS errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error("Unsupported record type: {0}")]
    UnsupportedRecordType(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

pub type DnsResult<T> = Result<T, DnsError>;
