//! In-memory certificate inventory

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{CertificateRecord, CertificateStatus, CertificateStore};
use crate::acme::error::StoreError;

/// Certificate inventory that lives only as long as the process
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryCertificateStore {
    records: Arc<DashMap<String, CertificateRecord>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn get(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self
            .records
            .get(&domain.to_ascii_lowercase())
            .map(|r| r.value().clone()))
    }

    async fn upsert(&self, record: CertificateRecord) -> Result<(), StoreError> {
        record.check()?;
        debug!(domain = %record.domain, status = %record.status, "Stored certificate record");
        self.records.insert(record.domain.to_ascii_lowercase(), record);
        Ok(())
    }

    async fn find_expiring_active(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut found: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.status == CertificateStatus::Active && r.expires_at < before)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(found)
    }

    async fn set_status(
        &self,
        domain: &str,
        status: CertificateStatus,
    ) -> Result<usize, StoreError> {
        match self.records.get_mut(&domain.to_ascii_lowercase()) {
            Some(mut record) if record.status != status => {
                record.status = status;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut all: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(all)
    }
}
