//! Issue-or-renew capability
//!
//! [`AcmeClient`] issues directly. [`RetryingIssuer`] wraps any issuer with a
//! [`RetryPolicy`], retrying only the failures another attempt could fix.

use std::sync::Arc;

use async_trait::async_trait;
use tlsward_common::RetryPolicy;

use super::client::AcmeClient;
use super::error::AcmeError;
use super::store::CertificateRecord;

/// Something that can produce a current certificate for a domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError>;
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        AcmeClient::issue_or_renew(self, domain).await
    }
}

#[async_trait]
impl<T: CertificateIssuer + ?Sized> CertificateIssuer for Arc<T> {
    async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        (**self).issue_or_renew(domain).await
    }
}

/// Issuer decorator adding bounded retry with exponential backoff
#[derive(Debug)]
pub struct RetryingIssuer<I> {
    inner: I,
    policy: RetryPolicy,
}

impl<I: CertificateIssuer> RetryingIssuer<I> {
    pub fn new(inner: I, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

#[async_trait]
impl<I: CertificateIssuer> CertificateIssuer for RetryingIssuer<I> {
    async fn issue_or_renew(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        let name = format!("issue_or_renew({})", domain);
        self.policy
            .run_if(&name, || self.inner.issue_or_renew(domain), AcmeError::is_retriable)
            .await
    }
}
