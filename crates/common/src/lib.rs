//! Common utilities shared across tlsward crates.
//!
//! Currently hosts the retry/backoff primitive used to wrap certificate
//! issuance.

pub mod retry;

pub use retry::RetryPolicy;
