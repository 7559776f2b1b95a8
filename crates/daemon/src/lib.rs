//! tlsward: ACME certificate issuance, renewal and zero-downtime TLS hot swap
//!
//! - **Issuance**: HTTP-01 orders against Let's Encrypt or any ACME CA
//! - **Inventory**: one durable record per domain with status and expiry
//! - **Renewal**: periodic sweeps with per-domain isolation and retry/backoff
//! - **Hot swap**: validated, atomically installed TLS configurations with
//!   drained handshakes and shredded staging files

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod http;
pub mod notify;
pub mod service;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use acme::{
    AcmeClient, AcmeError, CertificateIssuer, CertificateRecord, CertificateStatus,
    CertificateStore, ChallengeResponder, RenewalScheduler, RetryingIssuer, StoreError,
};
pub use app::{App, AppError};
pub use http::ChallengeServer;
pub use notify::{Notifier, TracingNotifier};
pub use service::{CertificateService, ServiceError};
pub use tls::{HttpsListener, TlsConfigError, TlsHotSwapManager, TlsSettings};
