//! Durable certificate inventory
//!
//! One [`CertificateRecord`] per domain. Renewal upserts by domain, so the
//! latest issued certificate always supersedes the previous one.

mod file;
mod memory;

pub use file::FileCertificateStore;
pub use memory::MemoryCertificateStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;

/// Lifecycle state of a stored certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertificateStatus {
    Active,
    Expired,
    Revoked,
    Pending,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateStatus::Active => "ACTIVE",
            CertificateStatus::Expired => "EXPIRED",
            CertificateStatus::Revoked => "REVOKED",
            CertificateStatus::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

/// A certificate and its private key, keyed by domain
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    /// PEM certificate chain, leaf first
    pub certificate_pem: String,
    /// PEM private key matching the leaf
    pub private_key_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CertificateStatus,
    /// CA account that issued the certificate
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub last_renewal_attempt: Option<DateTime<Utc>>,
}

impl CertificateRecord {
    /// Whether the certificate expires within `threshold` of `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at <= now + threshold
    }

    /// Whole days until expiry (negative once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check the record invariants enforced on every upsert
    pub(crate) fn check(&self) -> Result<(), StoreError> {
        if self.domain.is_empty() {
            return Err(StoreError::InvalidKey(self.domain.clone()));
        }
        if self.expires_at <= self.issued_at {
            return Err(StoreError::Conflict {
                domain: self.domain.clone(),
                reason: format!(
                    "expires_at {} is not after issued_at {}",
                    self.expires_at, self.issued_at
                ),
            });
        }
        Ok(())
    }
}

// The private key never reaches logs.
impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .field("certificate_pem_len", &self.certificate_pem.len())
            .field("private_key_pem", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .field("account_id", &self.account_id)
            .field("last_renewal_attempt", &self.last_renewal_attempt)
            .finish()
    }
}

/// Certificate inventory
///
/// Operations are atomic per record. Concurrent upserts to different domains
/// never conflict; concurrent upserts to the same domain resolve
/// last-write-wins.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError>;

    /// Insert or replace the record for `record.domain`
    ///
    /// Rejects records whose expiry is not after their issue time.
    async fn upsert(&self, record: CertificateRecord) -> Result<(), StoreError>;

    /// Active records expiring strictly before `before`
    async fn find_expiring_active(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, StoreError>;

    /// Set the status of one record, returning how many records changed (0 or 1)
    async fn set_status(&self, domain: &str, status: CertificateStatus)
        -> Result<usize, StoreError>;

    /// Every record, sorted by domain
    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError>;
}
