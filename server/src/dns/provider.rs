//! Zone provider capability
//!
//! The minimal set of operations the record manager needs from a remote
//! zone: query by (type, name), create, update by id, delete by id. Record
//! ids are never cached by callers; every operation starts from a fresh query.

use async_trait::async_trait;
use std::fmt::Debug;

use super::types::{DnsRecord, DnsResult, RecordType};

#[async_trait]
pub trait ZoneProvider: Send + Sync + Debug {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// All records in the zone matching `record_type` and fully-qualified `name`
    async fn find_records(&self, record_type: RecordType, name: &str) -> DnsResult<Vec<DnsRecord>>;

    /// Create a record, returning it with its provider-assigned id
    async fn create_record(
        &self,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord>;

    /// Replace the content of the record identified by `id`
    async fn update_record(
        &self,
        id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> DnsResult<DnsRecord>;

    /// Delete the record identified by `id`. Deleting a record that is
    /// already gone succeeds.
    async fn delete_record(&self, id: &str) -> DnsResult<()>;
}
