//! Zero-downtime TLS configuration swap
//!
//! # Protocol
//!
//! ```text
//! validate (memory) ─> stage to owner-only files ─> build ServerConfig
//!        │                                              │
//!        └─ reject, nothing touched                     v
//!                                   atomic ArcSwap store (new generation)
//!                                                       │
//!                 zero + delete staged files <──────────┘
//!                                                       │
//!                 release swap lock ─> drain previous generation's handshakes
//! ```
//!
//! The listener loads the live configuration once per accepted connection,
//! so a handshake that started before the swap finishes against the old
//! configuration and every later connection sees the new one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ServerConfig, SupportedProtocolVersion};
use tokio::sync::{Mutex, MutexGuard};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use tlsward_config::{Config, MinTlsVersion};

use super::drain::HandshakeTracker;
use super::error::TlsConfigError;
use super::material::{load_certified_key, validate_material, StagedMaterial};
use super::placeholder;

/// Settings for building and swapping TLS configurations
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub min_tls_version: MinTlsVersion,
    /// Parent directory for transient staged material
    pub staging_dir: PathBuf,
    /// How long an activation waits for the previous generation to drain
    pub drain_timeout: Duration,
    /// Names on the self-signed placeholder
    pub placeholder_names: Vec<String>,
}

impl TlsSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_tls_version: config.listener.min_tls_version,
            staging_dir: config.storage.staging_dir(),
            drain_timeout: config.listener.drain_timeout(),
            placeholder_names: config.acme.domains.clone(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One installed TLS configuration
#[derive(Debug)]
pub struct LiveTlsConfig {
    generation: u64,
    server_config: Arc<ServerConfig>,
    handshakes: HandshakeTracker,
    /// Names with a dedicated certificate; others get the default
    names: Vec<String>,
    placeholder: bool,
}

impl LiveTlsConfig {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn server_config(&self) -> &Arc<ServerConfig> {
        &self.server_config
    }

    pub fn handshakes(&self) -> &HandshakeTracker {
        &self.handshakes
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether only the self-signed placeholder is being served
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server_config))
    }
}

/// Outcome of a successful activation
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub generation: u64,
    pub names: Vec<String>,
    pub not_after: DateTime<Utc>,
    /// Whether the previous generation finished its handshakes in time
    pub drained: bool,
}

/// SNI certificate selection for one generation
#[derive(Debug)]
struct SniResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    default: Arc<CertifiedKey>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let by_sni = client_hello
            .server_name()
            .map(|name| name.trim_end_matches('.').to_ascii_lowercase())
            .and_then(|name| self.by_name.get(&name).cloned());
        Some(by_sni.unwrap_or_else(|| Arc::clone(&self.default)))
    }
}

/// State only touched while holding the swap lock
#[derive(Debug)]
struct SwapState {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    next_generation: u64,
}

/// Owns the live TLS configuration and replaces it atomically
pub struct TlsHotSwapManager {
    settings: TlsSettings,
    provider: Arc<CryptoProvider>,
    live: Arc<ArcSwap<LiveTlsConfig>>,
    swap: Mutex<SwapState>,
}

impl TlsHotSwapManager {
    /// Start serving a self-signed placeholder
    pub fn new(settings: TlsSettings) -> Result<Self, TlsConfigError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let (cert_pem, key_pem) = placeholder::self_signed(&settings.placeholder_names)?;
        let staged = StagedMaterial::write(&settings.staging_dir, &cert_pem, &key_pem)
            .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("cannot stage placeholder: {}", e)))?;
        let built = staged_paths(&staged).and_then(|(cert, key)| load_certified_key(cert, key, &provider));
        destroy_staged(staged);
        let default = built?;

        let resolver = SniResolver {
            by_name: HashMap::new(),
            default,
        };
        let server_config = build_server_config(&provider, settings.min_tls_version, resolver)?;

        info!(
            min_tls_version = ?settings.min_tls_version,
            "Serving self-signed placeholder certificate"
        );

        Ok(Self {
            live: Arc::new(ArcSwap::from_pointee(LiveTlsConfig {
                generation: 0,
                server_config,
                handshakes: HandshakeTracker::new(),
                names: Vec::new(),
                placeholder: true,
            })),
            swap: Mutex::new(SwapState {
                by_name: HashMap::new(),
                next_generation: 1,
            }),
            settings,
            provider,
        })
    }

    /// Shared slot the listener loads from
    pub fn live(&self) -> Arc<ArcSwap<LiveTlsConfig>> {
        Arc::clone(&self.live)
    }

    /// Currently installed configuration
    pub fn current(&self) -> Arc<LiveTlsConfig> {
        self.live.load_full()
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    /// Install new material, failing fast if another swap is running
    pub async fn activate(
        &self,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<ActivationReport, TlsConfigError> {
        let guard = self.swap.try_lock().map_err(|_| {
            debug!("Activation rejected, swap already in progress");
            TlsConfigError::SwapInProgress
        })?;
        self.activate_locked(guard, certificate_pem, private_key_pem).await
    }

    /// Install new material, waiting for any running swap to finish first
    pub async fn activate_waiting(
        &self,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<ActivationReport, TlsConfigError> {
        let guard = self.swap.lock().await;
        self.activate_locked(guard, certificate_pem, private_key_pem).await
    }

    async fn activate_locked(
        &self,
        mut guard: MutexGuard<'_, SwapState>,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<ActivationReport, TlsConfigError> {
        let summary = validate_material(certificate_pem, private_key_pem, &self.provider)
            .inspect_err(|e| warn!(error = %e, "Rejected TLS material"))?;

        let staged = StagedMaterial::write(&self.settings.staging_dir, certificate_pem, private_key_pem)
            .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("cannot stage material: {}", e)))?;
        let built = staged_paths(&staged)
            .and_then(|(cert, key)| load_certified_key(cert, key, &self.provider))
            .and_then(|certified| {
                let mut by_name = guard.by_name.clone();
                for name in &summary.names {
                    by_name.insert(name.clone(), Arc::clone(&certified));
                }
                let resolver = SniResolver {
                    by_name: by_name.clone(),
                    default: certified,
                };
                let config = build_server_config(&self.provider, self.settings.min_tls_version, resolver)?;
                Ok((config, by_name))
            });
        destroy_staged(staged);

        let (server_config, by_name) = built.inspect_err(|e| {
            error!(error = %e, "TLS swap failed, previous configuration stays live");
        })?;

        let generation = guard.next_generation;
        let mut names: Vec<String> = by_name.keys().cloned().collect();
        names.sort();

        let previous = self.live.swap(Arc::new(LiveTlsConfig {
            generation,
            server_config,
            handshakes: HandshakeTracker::new(),
            names,
            placeholder: false,
        }));
        guard.by_name = by_name;
        guard.next_generation += 1;
        drop(guard);

        info!(
            generation = generation,
            previous_generation = previous.generation,
            names = ?summary.names,
            not_after = %summary.not_after,
            "Activated new TLS certificate"
        );

        let drained = previous
            .handshakes
            .wait_for_drain(previous.generation, self.settings.drain_timeout)
            .await;

        Ok(ActivationReport {
            generation,
            names: summary.names,
            not_after: summary.not_after,
            drained,
        })
    }
}

impl std::fmt::Debug for TlsHotSwapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.live.load();
        f.debug_struct("TlsHotSwapManager")
            .field("settings", &self.settings)
            .field("generation", &live.generation)
            .field("names", &live.names)
            .finish()
    }
}

fn staged_paths(staged: &StagedMaterial) -> Result<(&std::path::Path, &std::path::Path), TlsConfigError> {
    match (staged.cert_path(), staged.key_path()) {
        (Some(cert), Some(key)) => Ok((cert, key)),
        _ => Err(TlsConfigError::ListenerSwapFailed(
            "staged material is incomplete".to_string(),
        )),
    }
}

fn destroy_staged(staged: StagedMaterial) {
    if let Err(e) = staged.destroy() {
        error!(error = %e, "Failed to destroy staged TLS material");
    }
}

fn protocol_versions(min: MinTlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12_AND_UP: [&SupportedProtocolVersion; 2] = [&TLS13, &TLS12];
    static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&TLS13];
    match min {
        MinTlsVersion::Tls12 => &TLS12_AND_UP,
        MinTlsVersion::Tls13 => &TLS13_ONLY,
    }
}

fn build_server_config(
    provider: &Arc<CryptoProvider>,
    min: MinTlsVersion,
    resolver: SniResolver,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let mut config = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(protocol_versions(min))
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("unsupported protocol set: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::placeholder::self_signed;
    use tempfile::TempDir;

    fn manager(staging: &TempDir) -> TlsHotSwapManager {
        TlsHotSwapManager::new(TlsSettings {
            min_tls_version: MinTlsVersion::Tls12,
            staging_dir: staging.path().to_path_buf(),
            drain_timeout: Duration::from_secs(1),
            placeholder_names: vec!["example.test".to_string()],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_starts_with_placeholder() {
        let staging = TempDir::new().unwrap();
        let manager = manager(&staging);

        let live = manager.current();
        assert_eq!(live.generation(), 0);
        assert!(live.is_placeholder());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_activate_bumps_generation() {
        let staging = TempDir::new().unwrap();
        let manager = manager(&staging);
        let (cert, key) = self_signed(&["example.test".to_string()]).unwrap();

        let report = manager.activate(&cert, &key).await.unwrap();

        assert_eq!(report.generation, 1);
        assert!(report.drained);
        assert_eq!(report.names, vec!["example.test".to_string()]);
        let live = manager.current();
        assert_eq!(live.generation(), 1);
        assert!(!live.is_placeholder());
        assert_eq!(live.names(), ["example.test".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_material_leaves_live_config() {
        let staging = TempDir::new().unwrap();
        let manager = manager(&staging);
        let (cert, _) = self_signed(&["a.test".to_string()]).unwrap();
        let (_, wrong_key) = self_signed(&["b.test".to_string()]).unwrap();
        let before = manager.current();

        let err = manager.activate(&cert, &wrong_key).await.unwrap_err();

        assert!(matches!(err, TlsConfigError::InvalidMaterial(_)));
        assert!(Arc::ptr_eq(&before, &manager.current()));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_activate_reports_swap_in_progress() {
        let staging = TempDir::new().unwrap();
        let manager = manager(&staging);
        let (cert, key) = self_signed(&["example.test".to_string()]).unwrap();

        let held = manager.swap.lock().await;
        let err = manager.activate(&cert, &key).await.unwrap_err();
        assert!(matches!(err, TlsConfigError::SwapInProgress));
        drop(held);

        assert!(manager.activate(&cert, &key).await.is_ok());
    }

    #[tokio::test]
    async fn test_certificates_accumulate_per_name() {
        let staging = TempDir::new().unwrap();
        let manager = manager(&staging);
        let (a_cert, a_key) = self_signed(&["a.test".to_string()]).unwrap();
        let (b_cert, b_key) = self_signed(&["b.test".to_string()]).unwrap();

        manager.activate(&a_cert, &a_key).await.unwrap();
        manager.activate_waiting(&b_cert, &b_key).await.unwrap();

        assert_eq!(
            manager.current().names(),
            ["a.test".to_string(), "b.test".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tls13_only_policy_builds() {
        let staging = TempDir::new().unwrap();
        let manager = TlsHotSwapManager::new(TlsSettings {
            min_tls_version: MinTlsVersion::Tls13,
            staging_dir: staging.path().to_path_buf(),
            drain_timeout: Duration::from_secs(1),
            placeholder_names: Vec::new(),
        })
        .unwrap();

        let (cert, key) = self_signed(&["example.test".to_string()]).unwrap();
        assert!(manager.activate(&cert, &key).await.is_ok());
    }
}
