//! Filesystem-backed certificate inventory
//!
//! # Directory Structure
//!
//! ```text
//! state_dir/
//! └── domains/
//!     ├── example.com.json      # CertificateRecord (0600)
//!     └── www.example.com.json
//! ```
//!
//! Records are written to a temporary file in the same directory and renamed
//! into place, so a reader never sees a half-written record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

use super::{CertificateRecord, CertificateStatus, CertificateStore};
use crate::acme::error::StoreError;

const DOMAINS_DIR: &str = "domains";
const RECORD_EXTENSION: &str = "json";

/// Certificate inventory stored as one JSON file per domain
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    domains_path: PathBuf,
    /// Serializes read-modify-write sequences per domain
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCertificateStore {
    /// Open (creating if needed) the inventory under `state_dir`
    ///
    /// Directories are restricted to the owner (0700 on Unix).
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let domains_path = state_dir.join(DOMAINS_DIR);
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(state_dir, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        info!(
            state_dir = %state_dir.display(),
            "Opened certificate inventory"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                domains_path,
                locks: DashMap::new(),
            }),
        })
    }

    pub fn domains_path(&self) -> &Path {
        &self.inner.domains_path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::IoFailure(std::io::Error::other(e)))?
    }
}

impl Inner {
    fn record_path(&self, domain: &str) -> Result<PathBuf, StoreError> {
        let usable = !domain.is_empty()
            && !domain.starts_with('.')
            && !domain.contains("..")
            && !domain.contains(['/', '\\', '\0']);
        if !usable {
            return Err(StoreError::InvalidKey(domain.to_string()));
        }
        Ok(self
            .domains_path
            .join(format!("{}.{}", domain.to_ascii_lowercase(), RECORD_EXTENSION)))
    }

    fn lock_for(&self, domain: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .clone()
    }

    fn read(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let path = self.record_path(domain)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(domain = %domain, "No stored certificate record");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.domain)?;
        let json = serde_json::to_vec_pretty(record)?;

        // NamedTempFile is created 0600 on Unix
        let mut staged = NamedTempFile::new_in(&self.domains_path)?;
        staged.write_all(&json)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| StoreError::IoFailure(e.error))?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.domains_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CertificateRecord>(&bytes)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable certificate record"
                ),
            }
        }
        records.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(records)
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn get(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let domain = domain.to_string();
        self.blocking(move |inner| inner.read(&domain)).await
    }

    async fn upsert(&self, record: CertificateRecord) -> Result<(), StoreError> {
        record.check()?;
        self.blocking(move |inner| {
            let lock = inner.lock_for(&record.domain);
            let _guard = lock.lock();
            inner.write(&record)?;
            info!(
                domain = %record.domain,
                status = %record.status,
                expires_at = %record.expires_at,
                "Stored certificate record"
            );
            Ok(())
        })
        .await
    }

    async fn find_expiring_active(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        let records = self.blocking(|inner| inner.read_all()).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.status == CertificateStatus::Active && r.expires_at < before)
            .collect())
    }

    async fn set_status(
        &self,
        domain: &str,
        status: CertificateStatus,
    ) -> Result<usize, StoreError> {
        let domain = domain.to_string();
        self.blocking(move |inner| {
            let lock = inner.lock_for(&domain);
            let _guard = lock.lock();
            let Some(mut record) = inner.read(&domain)? else {
                return Ok(0);
            };
            if record.status == status {
                return Ok(0);
            }
            debug!(domain = %domain, from = %record.status, to = %status, "Updating certificate status");
            record.status = status;
            inner.write(&record)?;
            Ok(1)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        self.blocking(|inner| inner.read_all()).await
    }
}
