//! Live TLS configuration
//!
//! [`TlsHotSwapManager`] is the only way to change what the HTTPS listener
//! serves. It validates new material, installs it atomically, and drains the
//! previous configuration.

pub mod drain;
mod error;
mod hot_swap;
mod listener;
pub mod material;
pub mod placeholder;

pub use error::TlsConfigError;
pub use hot_swap::{ActivationReport, LiveTlsConfig, TlsHotSwapManager, TlsSettings};
pub use listener::HttpsListener;
