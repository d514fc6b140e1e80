//! Cloudflare zone provider
//!
//! Talks to the Cloudflare v4 API for a single zone. The zone id is resolved
//! once in [`CloudflareZone::connect`]; record ids are always looked up
//! fresh.
//! API documentation: <https://developers.cloudflare.com/api/>

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::provider::ZoneProvider;
use super::types::{DnsError, DnsRecord, DnsResult, RecordType};

/// Cloudflare API base URL
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloudflare credentials
#[derive(Clone)]
pub enum CloudflareAuth {
    /// Scoped API token (preferred)
    Token(String),
    /// Legacy global API key
    Key { email: String, key: String },
}

impl fmt::Debug for CloudflareAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudflareAuth::Token(_) => f.write_str("Token(<redacted>)"),
            CloudflareAuth::Key { email, .. } => {
                write!(f, "Key {{ email: {}, key: <redacted> }}", email)
            }
        }
    }
}

impl CloudflareAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            CloudflareAuth::Token(token) => request.bearer_auth(token),
            CloudflareAuth::Key { email, key } => request
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", key),
        }
    }
}

/// One Cloudflare zone
#[derive(Debug)]
pub struct CloudflareZone {
    client: Client,
    base_url: String,
    auth: CloudflareAuth,
    zone_name: String,
    zone_id: String,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ZoneInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordInfo {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

impl TryFrom<RecordInfo> for DnsRecord {
    type Error = DnsError;

    fn try_from(info: RecordInfo) -> Result<Self, Self::Error> {
        Ok(DnsRecord {
            record_type: info.record_type.parse()?,
            id: info.id,
            name: info.name,
            content: info.content,
        })
    }
}

fn describe(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "no error details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CloudflareZone {
    /// Resolve `zone_name` against the public Cloudflare API
    pub async fn connect(zone_name: &str, auth: CloudflareAuth, ttl: u32) -> DnsResult<Self> {
        Self::connect_with_base(CLOUDFLARE_API_BASE, zone_name, auth, ttl).await
    }

    /// Resolve `zone_name` against an API at `base_url`
    pub async fn connect_with_base(
        base_url: &str,
        zone_name: &str,
        auth: CloudflareAuth,
        ttl: u32,
    ) -> DnsResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DnsError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let mut zone = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            zone_name: zone_name.trim_end_matches('.').to_string(),
            zone_id: String::new(),
            ttl,
        };

        let request = zone
            .client
            .get(format!("{}/zones", zone.base_url))
            .query(&[("name", zone.zone_name.as_str())]);
        let zones: Vec<ZoneInfo> = zone.send(request, "list zones").await?;

        let found = zones
            .into_iter()
            .find(|z| z.name.eq_ignore_ascii_case(&zone.zone_name))
            .ok_or_else(|| DnsError::ZoneNotFound(zone.zone_name.clone()))?;

        debug!(zone = %found.name, zone_id = %found.id, "Resolved Cloudflare zone");
        zone.zone_id = found.id;
        Ok(zone)
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.base_url, self.zone_id)
    }

    /// Send an authenticated request and unwrap the response envelope
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> DnsResult<T> {
        let response = self
            .auth
            .apply(request)
            .send()
            .await
            .map_err(|e| DnsError::ProviderError(format!("Failed to {}: {}", what, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DnsError::Authentication(format!(
                "Cloudflare rejected credentials ({}) while trying to {}",
                status, what
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DnsError::ProviderError(format!("Failed to {}: {}", what, e)))?;
        trace!(status = %status, body = %body, "Cloudflare response");

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            DnsError::ProviderError(format!(
                "Failed to {}: HTTP {} with unparseable body: {}",
                what, status, e
            ))
        })?;

        if !status.is_success() || !envelope.success {
            return Err(DnsError::ProviderError(format!(
                "Failed to {}: HTTP {} - {}",
                what,
                status,
                describe(&envelope.errors)
            )));
        }

        envelope
            .result
            .ok_or_else(|| DnsError::ProviderError(format!("Failed to {}: empty result", what)))
    }
}

#[async_trait]
impl ZoneProvider for CloudflareZone {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn find_records(&self, record_type: RecordType, name: &str) -> DnsResult<Vec<DnsRecord>> {
        let request = self
            .client
            .get(self.records_url())
            .query(&[("type", record_type.as_str()), ("name", name)]);
        let records: Vec<RecordInfo> = self.send(request, "list DNS records").await?;

        records.into_iter().map(DnsRecord::try_from).collect()
    }

    async fn create_record(
        &self,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        let body = RecordBody {
            record_type: record_type.as_str(),
            name,
            content,
            ttl: self.ttl,
        };
        let request = self.client.post(self.records_url()).json(&body);
        let created: RecordInfo = self.send(request, "create DNS record").await?;

        debug!(record_type = %record_type, name = %name, record_id = %created.id, "Created DNS record");
        created.try_into()
    }

    async fn update_record(
        &self,
        id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        let body = RecordBody {
            record_type: record_type.as_str(),
            name,
            content,
            ttl: self.ttl,
        };
        let request = self
            .client
            .patch(format!("{}/{}", self.records_url(), id))
            .json(&body);
        let updated: RecordInfo = self.send(request, "update DNS record").await?;

        debug!(record_type = %record_type, name = %name, record_id = %id, "Updated DNS record");
        updated.try_into()
    }

    async fn delete_record(&self, id: &str) -> DnsResult<()> {
        let request = self
            .auth
            .apply(self.client.delete(format!("{}/{}", self.records_url(), id)));
        let response = request
            .send()
            .await
            .map_err(|e| DnsError::ProviderError(format!("Failed to delete DNS record: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(record_id = %id, "DNS record already gone");
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DnsError::Authentication(format!(
                "Cloudflare rejected credentials ({}) while deleting a DNS record",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DnsError::ProviderError(format!(
                "Failed to delete DNS record {}: HTTP {} - {}",
                id, status, body
            )));
        }

        debug!(record_id = %id, "Deleted DNS record");
        Ok(())
    }
}
