//! Issue-then-activate orchestration
//!
//! [`CertificateService::apply`] is the single path by which a freshly
//! issued certificate reaches the live listener. The CLI and the renewal
//! scheduler both go through it.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::acme::{AcmeError, CertificateIssuer, CertificateRecord, CertificateStatus, CertificateStore, StoreError};
use crate::notify::Notifier;
use crate::tls::{TlsConfigError, TlsHotSwapManager};

/// Errors from [`CertificateService`]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error("certificate for {domain} was stored but could not be activated: {source}")]
    Activation {
        domain: String,
        #[source]
        source: TlsConfigError,
    },

    #[error("issuance task for {domain} ended abnormally: {reason}")]
    TaskFailed { domain: String, reason: String },
}

/// Runs issuance and hands the result to the TLS listener
pub struct CertificateService {
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<dyn CertificateStore>,
    /// Absent in one-shot processes that run no listener
    tls: Option<Arc<TlsHotSwapManager>>,
    notifier: Arc<dyn Notifier>,
}

impl CertificateService {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        store: Arc<dyn CertificateStore>,
        tls: Option<Arc<TlsHotSwapManager>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            issuer,
            store,
            tls,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    pub fn tls(&self) -> Option<&Arc<TlsHotSwapManager>> {
        self.tls.as_ref()
    }

    /// Issue or renew `domain`, then activate the resulting certificate
    ///
    /// Issuance runs on its own task so authorization polling never occupies
    /// the caller's task. Failures are reported to the notifier and returned;
    /// the stored record is left as it was.
    #[instrument(skip(self))]
    pub async fn apply(&self, domain: &str) -> Result<CertificateRecord, ServiceError> {
        let issuer = Arc::clone(&self.issuer);
        let owned = domain.to_string();
        let issued = tokio::spawn(async move { issuer.issue_or_renew(&owned).await }).await;

        let record = match issued {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                error!(error = %e, retriable = e.is_retriable(), "Certificate issuance failed");
                self.notifier
                    .notify(
                        &format!("Certificate issuance failed for {}", domain),
                        &e.to_string(),
                    )
                    .await;
                return Err(e.into());
            }
            Err(e) => {
                let reason = if e.is_panic() { "panicked" } else { "cancelled" }.to_string();
                error!(reason = %reason, "Certificate issuance task ended abnormally");
                self.notifier
                    .notify(
                        &format!("Certificate issuance failed for {}", domain),
                        &format!("issuance task {}", reason),
                    )
                    .await;
                return Err(ServiceError::TaskFailed {
                    domain: domain.to_string(),
                    reason,
                });
            }
        };

        if let Some(tls) = &self.tls {
            if let Err(source) = tls
                .activate_waiting(&record.certificate_pem, &record.private_key_pem)
                .await
            {
                error!(error = %source, "Issued certificate could not be activated");
                self.notifier
                    .notify(
                        &format!("Certificate activation failed for {}", domain),
                        &source.to_string(),
                    )
                    .await;
                return Err(ServiceError::Activation {
                    domain: record.domain,
                    source,
                });
            }
        } else {
            debug!("No TLS listener in this process, skipping activation");
        }

        info!(expires_at = %record.expires_at, "Certificate applied");
        Ok(record)
    }

    /// Activate stored, unexpired ACTIVE certificates for `domains`
    ///
    /// Used at startup so the listener serves real certificates before the
    /// first sweep. Returns how many were activated.
    /// Unreadable records are skipped with a warning.
    pub async fn activate_stored(&self, domains: &[String]) -> usize {
        let Some(tls) = &self.tls else {
            return 0;
        };

        let now = Utc::now();
        let mut activated = 0;
        for domain in domains {
            let record = match self.store.get(domain).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(domain = %domain, "No stored certificate, placeholder stays");
                    continue;
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Stored certificate unreadable, placeholder stays");
                    continue;
                }
            };
            if record.status != CertificateStatus::Active || record.is_expired(now) {
                debug!(domain = %domain, status = %record.status, "Stored certificate not usable");
                continue;
            }

            match tls
                .activate_waiting(&record.certificate_pem, &record.private_key_pem)
                .await
            {
                Ok(_) => activated += 1,
                Err(e) => warn!(domain = %domain, error = %e, "Stored certificate rejected"),
            }
        }

        info!(activated = activated, configured = domains.len(), "Activated stored certificates");
        activated
    }

    /// Log and notify a store failure that affects only `domain`
    pub(crate) async fn report_store_failure(&self, domain: &str, err: &StoreError) {
        error!(domain = %domain, error = %err, "Certificate record unreadable");
        self.notifier
            .notify(
                &format!("Certificate inventory unreadable for {}", domain),
                &err.to_string(),
            )
            .await;
    }
}

impl std::fmt::Debug for CertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateService")
            .field("has_tls", &self.tls.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::tls::placeholder;

    /// Issues self-signed certificates, failing for the listed domains
    pub struct FakeIssuer {
        store: Arc<dyn CertificateStore>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeIssuer {
        pub fn new(store: Arc<dyn CertificateStore>, failing: &[&str]) -> Self {
            Self {
                store,
                failing: failing.iter().map(|d| d.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CertificateIssuer for FakeIssuer {
        async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
            self.calls.lock().push(domain.to_string());
            if self.failing.contains(domain) {
                return Err(AcmeError::AuthorizationFailed {
                    domain: domain.to_string(),
                    reason: "challenge response mismatch".to_string(),
                });
            }

            let (certificate_pem, private_key_pem) = placeholder::self_signed(&[domain.to_string()])
                .map_err(|e| AcmeError::CertFetchError(e.to_string()))?;
            let now = Utc::now();
            let record = CertificateRecord {
                domain: domain.to_string(),
                certificate_pem,
                private_key_pem,
                issued_at: now,
                expires_at: now + chrono::Duration::days(90),
                status: CertificateStatus::Active,
                account_id: Some("https://ca.test/acct/1".to_string()),
                last_renewal_attempt: Some(now),
            };
            self.store.upsert(record.clone()).await?;
            Ok(record)
        }
    }
}
