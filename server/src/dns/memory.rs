//! In-process zone provider
//!
//! Holds records in memory. Used by `provider = "memory"` for local runs
//! where nothing needs to resolve publicly, and by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::provider::ZoneProvider;
use super::types::{DnsError, DnsRecord, DnsResult, RecordType};

#[derive(Debug, Default)]
pub struct InMemoryZone {
    records: RwLock<BTreeMap<String, DnsRecord>>,
    next_id: AtomicU64,
}

impl InMemoryZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record in the zone
    pub async fn records(&self) -> Vec<DnsRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Insert a record directly, bypassing reconciliation.
    /// Mimics out-of-band edits made in the provider's own console.
    pub async fn insert_raw(&self, record_type: RecordType, name: &str, content: &str) -> DnsRecord {
        let record = DnsRecord {
            id: self.allocate_id(),
            record_type,
            name: name.to_string(),
            content: content.to_string(),
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    fn allocate_id(&self) -> String {
        format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ZoneProvider for InMemoryZone {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find_records(&self, record_type: RecordType, name: &str) -> DnsResult<Vec<DnsRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.record_type == record_type && r.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn create_record(
        &self,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        Ok(self.insert_raw(record_type, name, content).await)
    }

    async fn update_record(
        &self,
        id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| DnsError::RecordNotFound(id.to_string()))?;

        record.record_type = record_type;
        record.name = name.to_string();
        record.content = content.to_string();
        Ok(record.clone())
    }

    async fn delete_record(&self, id: &str) -> DnsResult<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}
