use thiserror::Error;

/// TLS reconfiguration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    /// The certificate or key was rejected before touching live state
    #[error("invalid TLS material: {0}")]
    InvalidMaterial(String),

    /// Another activation holds the swap lock
    #[error("a TLS configuration swap is already in progress")]
    SwapInProgress,

    /// Building or installing the new configuration failed; the previous
    /// configuration is still live
    #[error("TLS listener swap failed: {0}")]
    ListenerSwapFailed(String),
}
