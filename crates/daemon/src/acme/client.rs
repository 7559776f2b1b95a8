//! ACME issuance state machine
//!
//! # Flow
//!
//! ```text
//! stored record still fresh? ──yes──> return it (no CA contact)
//!        │ no
//!        v
//! account (restore or register) ─> domain key (load or generate)
//!        v
//! new order ─> for each authorization:
//!                register token ─> trigger validation ─> poll until
//!                VALID | INVALID | timeout   (token withdrawn on every exit)
//!        v
//! CSR ─> finalize ─> poll order ─> download chain ─> upsert record
//! ```
//!
//! An attempt either persists a complete ACTIVE record or persists nothing.
//! Abandoned CA-side orders are left to expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use tlsward_config::AcmeSettings;

use super::ca::{
    AcmeAccount, AcmeOrder, AuthorizationInfo, AuthorizationStatus, CertificateAuthority,
    OrderStatus,
};
use super::challenge::ChallengeResponder;
use super::error::AcmeError;
use super::keys::KeyStore;
use super::store::{CertificateRecord, CertificateStatus, CertificateStore};
use crate::tls::material::leaf_not_after;

/// Issuance parameters resolved from configuration
#[derive(Debug, Clone)]
pub struct AcmeClientConfig {
    /// Contact addresses registered with the CA account
    pub contact: Vec<String>,
    /// Renew once a certificate expires within this window
    pub renewal_threshold: chrono::Duration,
    /// Delay between authorization and order status checks
    pub poll_interval: Duration,
    /// Upper bound on resolving one authorization
    pub challenge_timeout: Duration,
    /// Upper bound on waiting for the CA to issue after finalizing
    pub finalize_timeout: Duration,
}

impl AcmeClientConfig {
    pub fn from_settings(settings: &AcmeSettings) -> Self {
        Self {
            contact: Some(settings.contact_email.trim())
                .filter(|email| !email.is_empty())
                .map(str::to_string)
                .into_iter()
                .collect(),
            renewal_threshold: chrono::Duration::days(i64::from(settings.renewal_threshold_days)),
            poll_interval: settings.challenge_poll_interval(),
            challenge_timeout: settings.challenge_timeout(),
            finalize_timeout: settings.finalize_timeout(),
        }
    }

    /// Polls allowed within the challenge timeout
    fn max_authorization_polls(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = self.challenge_timeout.as_millis().div_ceil(interval);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }
}

impl Default for AcmeClientConfig {
    fn default() -> Self {
        Self::from_settings(&AcmeSettings::default())
    }
}

/// Drives certificate orders against a CA
pub struct AcmeClient {
    config: AcmeClientConfig,
    authority: Arc<dyn CertificateAuthority>,
    store: Arc<dyn CertificateStore>,
    keys: Arc<KeyStore>,
    challenges: ChallengeResponder,
    account: OnceCell<Arc<dyn AcmeAccount>>,
}

impl AcmeClient {
    pub fn new(
        config: AcmeClientConfig,
        authority: Arc<dyn CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        keys: Arc<KeyStore>,
        challenges: ChallengeResponder,
    ) -> Self {
        Self {
            config,
            authority,
            store,
            keys,
            challenges,
            account: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AcmeClientConfig {
        &self.config
    }

    pub fn challenges(&self) -> &ChallengeResponder {
        &self.challenges
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    /// Return a fresh certificate for `domain`, issuing one if needed
    ///
    /// A stored ACTIVE record that does not expire within the renewal
    /// threshold is returned unchanged without contacting the CA.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        let domain = domain.trim().to_ascii_lowercase();
        tlsward_config::check_domain_name(&domain).map_err(|e| AcmeError::InvalidDomain {
            domain: domain.clone(),
            reason: e.to_string(),
        })?;

        let started = Utc::now();
        if let Some(existing) = self.store.get(&domain).await? {
            if existing.status == CertificateStatus::Active
                && !existing.needs_renewal(started, self.config.renewal_threshold)
            {
                debug!(
                    expires_at = %existing.expires_at,
                    "Certificate is still valid, skipping issuance"
                );
                return Ok(existing);
            }
            info!(
                status = %existing.status,
                expires_at = %existing.expires_at,
                "Renewing certificate"
            );
        } else {
            info!("Issuing first certificate");
        }

        let clock = Instant::now();
        let account = self.account().await?;
        let key = self.keys.domain_key(&domain).await?;

        let mut order = account.new_order(&domain).await?;
        let authorizations = order.authorizations().await?;
        if authorizations.is_empty() {
            return Err(AcmeError::OrderError(format!(
                "order {} carries no authorizations",
                order.id()
            )));
        }
        for authz in authorizations {
            self.resolve_authorization(order.as_mut(), authz).await?;
        }

        let csr = build_csr(&domain, &key)?;
        order.finalize(&csr).await?;
        let chain = self.await_certificate(order.as_mut()).await?;

        let expires_at = leaf_not_after(&chain).map_err(|e| {
            AcmeError::CertFetchError(format!("issued certificate is unreadable: {}", e))
        })?;

        let record = CertificateRecord {
            domain: domain.clone(),
            certificate_pem: chain,
            private_key_pem: key.serialize_pem(),
            issued_at: Utc::now(),
            expires_at,
            status: CertificateStatus::Active,
            account_id: Some(account.id().to_string()),
            last_renewal_attempt: Some(started),
        };
        self.store.upsert(record.clone()).await?;

        info!(
            expires_at = %record.expires_at,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Certificate issued"
        );
        Ok(record)
    }

    /// Restore the persisted account or register a new one, once per client
    async fn account(&self) -> Result<Arc<dyn AcmeAccount>, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                let account: Arc<dyn AcmeAccount> =
                    match self.keys.load_account_credentials().await? {
                        Some(credentials) => {
                            Arc::from(self.authority.restore_account(&credentials).await?)
                        }
                        None => {
                            let (account, credentials) =
                                self.authority.create_account(&self.config.contact).await?;
                            self.keys.save_account_credentials(credentials).await?;
                            Arc::from(account)
                        }
                    };
                Ok::<_, AcmeError>(account)
            })
            .await
            .cloned()
    }

    /// Prove control of one domain over HTTP-01
    async fn resolve_authorization(
        &self,
        order: &mut dyn AcmeOrder,
        authz: AuthorizationInfo,
    ) -> Result<(), AcmeError> {
        let domain = authz.domain;
        match authz.status {
            AuthorizationStatus::Valid => {
                debug!(domain = %domain, "Authorization already valid");
                return Ok(());
            }
            AuthorizationStatus::Invalid => {
                return Err(AcmeError::AuthorizationFailed {
                    domain,
                    reason: "authorization is no longer usable".to_string(),
                });
            }
            AuthorizationStatus::Pending | AuthorizationStatus::Processing => {}
        }

        let challenge = authz.http01.ok_or_else(|| AcmeError::AuthorizationFailed {
            domain: domain.clone(),
            reason: "CA offered no HTTP-01 challenge".to_string(),
        })?;

        let _registration = self
            .challenges
            .register_scoped(&challenge.token, &challenge.key_authorization);
        order.set_challenge_ready(&challenge.url).await?;
        debug!(domain = %domain, token = %challenge.token, "Validation requested");

        let interval = self.config.poll_interval;
        let max_polls = self.config.max_authorization_polls();
        let poll = async {
            for attempt in 1..=max_polls {
                tokio::time::sleep(interval).await;
                match order.refresh_authorization(&domain).await? {
                    AuthorizationStatus::Valid => {
                        info!(domain = %domain, polls = attempt, "Authorization valid");
                        return Ok(());
                    }
                    AuthorizationStatus::Invalid => {
                        return Err(AcmeError::AuthorizationFailed {
                            domain: domain.clone(),
                            reason: "CA could not validate the challenge response".to_string(),
                        });
                    }
                    AuthorizationStatus::Pending | AuthorizationStatus::Processing => {}
                }
            }
            Err(AcmeError::AuthorizationTimeout {
                domain: domain.clone(),
                timeout: self.config.challenge_timeout,
            })
        };

        match tokio::time::timeout(self.config.challenge_timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!(domain = %domain, token = %challenge.token, "Authorization timed out");
                Err(AcmeError::AuthorizationTimeout {
                    domain: domain.clone(),
                    timeout: self.config.challenge_timeout,
                })
            }
        }
    }

    /// Wait for the finalized order to become valid and download the chain
    async fn await_certificate(&self, order: &mut dyn AcmeOrder) -> Result<String, AcmeError> {
        let interval = self.config.poll_interval;
        let wait = async {
            loop {
                match order.poll_status().await? {
                    OrderStatus::Valid => return Ok(()),
                    OrderStatus::Invalid => {
                        return Err(AcmeError::FinalizeError(
                            "order became invalid after finalization".to_string(),
                        ))
                    }
                    OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        };

        tokio::time::timeout(self.config.finalize_timeout, wait)
            .await
            .map_err(|_| {
                AcmeError::FinalizeError(format!(
                    "certificate not issued within {:?}",
                    self.config.finalize_timeout
                ))
            })??;

        order
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::CertFetchError("CA returned no certificate".to_string()))
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("config", &self.config)
            .field("account_ready", &self.account.initialized())
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

/// DER-encoded CSR for `domain`, signed with the domain key
fn build_csr(domain: &str, key: &KeyPair) -> Result<Vec<u8>, AcmeError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::KeyMaterial(format!("cannot build CSR for {}: {}", domain, e)))?;
    params.distinguished_name = DistinguishedName::new();

    let csr = params
        .serialize_request(key)
        .map_err(|e| AcmeError::KeyMaterial(format!("cannot sign CSR for {}: {}", domain, e)))?;
    Ok(csr.der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_polls_cover_timeout() {
        let config = AcmeClientConfig {
            contact: vec!["ops@example.test".to_string()],
            renewal_threshold: chrono::Duration::days(30),
            poll_interval: Duration::from_secs(3),
            challenge_timeout: Duration::from_secs(180),
            finalize_timeout: Duration::from_secs(180),
        };
        assert_eq!(config.max_authorization_polls(), 60);

        let config = AcmeClientConfig {
            poll_interval: Duration::ZERO,
            ..config
        };
        assert_eq!(config.max_authorization_polls(), 180_000);
    }

    #[test]
    fn test_config_from_settings() {
        let config = AcmeClientConfig::default();
        assert_eq!(config.renewal_threshold, chrono::Duration::days(30));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.challenge_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_csr_is_der_encoded() {
        let key = KeyPair::generate().unwrap();
        let csr = build_csr("example.test", &key).unwrap();
        // DER SEQUENCE
        assert_eq!(csr[0], 0x30);
    }
}
