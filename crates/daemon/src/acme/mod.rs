//! ACME automatic certificate management
//!
//! Issues and renews certificates from Let's Encrypt and compatible CAs over
//! HTTP-01.
//!
//! # Architecture
//!
//! - [`CertificateStore`] - Durable certificate inventory keyed by domain
//! - [`ChallengeResponder`] - Tokens currently being proven, served over HTTP
//! - [`AcmeClient`] - Order state machine driving one issuance
//! - [`RetryingIssuer`] - Backoff wrapper around any [`CertificateIssuer`]
//! - [`RenewalScheduler`] - Periodic sweep over expiring records
//!
//! # Challenge Flow
//!
//! 1. [`AcmeClient`] creates an order for exactly one domain
//! 2. The CA hands out an HTTP-01 token per authorization
//! 3. [`ChallengeResponder`] publishes the token and its key authorization
//! 4. The CA fetches `/.well-known/acme-challenge/<token>` from the HTTP port
//! 5. The token is withdrawn as soon as the authorization resolves
//! 6. The client finalizes with a CSR, downloads the chain and upserts the record

pub mod ca;
mod challenge;
mod client;
mod error;
mod issuer;
mod keys;
mod scheduler;
pub mod store;

pub use ca::{CertificateAuthority, InstantAcmeAuthority};
pub use challenge::{ChallengeRegistration, ChallengeResponder, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, AcmeClientConfig};
pub use error::{AcmeError, StoreError};
pub use issuer::{CertificateIssuer, RetryingIssuer};
pub use keys::KeyStore;
pub use scheduler::{RenewalScheduler, SchedulerHandle, SweepReport};
pub use store::{
    CertificateRecord, CertificateStatus, CertificateStore, FileCertificateStore,
    MemoryCertificateStore,
};
