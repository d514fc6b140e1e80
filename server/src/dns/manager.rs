//! DNS Record Manager
//!
//! Brings typed records in the remote zone to a desired state. Every call
//! starts with a provider-side lookup by (type, name); record ids from a
//! previous call are never reused, so out-of-band edits are picked up.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::provider::ZoneProvider;
use super::types::{DnsRecord, DnsResult, RecordType};

#[derive(Debug, Clone)]
pub struct DnsRecordManager {
    provider: Arc<dyn ZoneProvider>,
}

impl DnsRecordManager {
    pub fn new(provider: Arc<dyn ZoneProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Create-or-update: every existing (type, name) match gets `content`;
    /// when there is none, exactly one record is created.
    pub async fn reconcile(
        &self,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<Vec<DnsRecord>> {
        let existing = self.provider.find_records(record_type, name).await?;

        if existing.is_empty() {
            let created = self.provider.create_record(record_type, name, content).await?;
            info!(record_type = %record_type, name = %name, content = %content, "Created DNS record");
            return Ok(vec![created]);
        }

        let mut updated = Vec::with_capacity(existing.len());
        for record in existing {
            if record.content == content {
                debug!(record_type = %record_type, name = %name, record_id = %record.id, "DNS record already up to date");
                updated.push(record);
                continue;
            }
            let record = self
                .provider
                .update_record(&record.id, record_type, name, content)
                .await?;
            info!(record_type = %record_type, name = %name, content = %content, "Updated DNS record");
            updated.push(record);
        }

        Ok(updated)
    }

    /// Whether any (type, name) record is visible. Lookup failures count as
    /// "not visible" so a polling loop keeps going.
    pub async fn exists(&self, record_type: RecordType, name: &str) -> bool {
        match self.provider.find_records(record_type, name).await {
            Ok(records) => !records.is_empty(),
            Err(e) => {
                warn!(record_type = %record_type, name = %name, error = %e, "DNS lookup failed, treating as absent");
                false
            }
        }
    }

    /// Delete every (type, name) record. Nothing to delete is success.
    pub async fn delete(&self, record_type: RecordType, name: &str) -> DnsResult<usize> {
        let existing = self.provider.find_records(record_type, name).await?;
        let count = existing.len();

        for record in existing {
            self.provider.delete_record(&record.id).await?;
        }

        if count > 0 {
            info!(record_type = %record_type, name = %name, count, "Deleted DNS records");
        }
        Ok(count)
    }
}
