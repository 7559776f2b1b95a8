//! Error types for certificate issuance and storage

use std::time::Duration;

use thiserror::Error;

/// Certificate inventory errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the domain
    #[error("no certificate record for {0}")]
    NotFound(String),

    /// The record violates an inventory invariant
    #[error("conflicting certificate record for {domain}: {reason}")]
    Conflict { domain: String, reason: String },

    /// The domain cannot be used as a storage key
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    /// Reading or writing the backing storage failed
    #[error("certificate storage I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// A stored record could not be decoded
    #[error("corrupt certificate record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// ACME issuance errors
///
/// Messages describe what failed without echoing CA responses verbatim or
/// any key material.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The domain was rejected before contacting the CA
    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// Account registration or lookup failed
    #[error("ACME account error: {0}")]
    AccountError(String),

    /// Creating the order or fetching its authorizations failed
    #[error("ACME order error: {0}")]
    OrderError(String),

    /// The CA marked the authorization invalid
    #[error("authorization failed for {domain}: {reason}")]
    AuthorizationFailed { domain: String, reason: String },

    /// The authorization did not resolve in time
    #[error("authorization for {domain} timed out after {timeout:?}")]
    AuthorizationTimeout { domain: String, timeout: Duration },

    /// Finalizing the order failed or timed out
    #[error("order finalization failed: {0}")]
    FinalizeError(String),

    /// Downloading or decoding the issued certificate failed
    #[error("certificate fetch failed: {0}")]
    CertFetchError(String),

    /// Loading, generating or encoding a key pair failed
    #[error("key material error: {0}")]
    KeyMaterial(String),

    /// The certificate inventory failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AcmeError {
    /// Whether another attempt could plausibly succeed
    ///
    /// Network and CA-side hiccups are transient. A malformed domain, an
    /// authorization the CA judged invalid, or broken local key material will
    /// fail the same way on every attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            AcmeError::AccountError(_)
            | AcmeError::OrderError(_)
            | AcmeError::AuthorizationTimeout { .. }
            | AcmeError::FinalizeError(_)
            | AcmeError::CertFetchError(_) => true,
            AcmeError::Store(StoreError::IoFailure(_)) => true,
            AcmeError::InvalidDomain { .. }
            | AcmeError::AuthorizationFailed { .. }
            | AcmeError::KeyMaterial(_)
            | AcmeError::Store(_) => false,
        }
    }
}
