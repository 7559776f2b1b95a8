//! Configuration for the tlsward certificate daemon
//!
//! The configuration is loaded from a TOML file. Every section and every
//! field has a default, so a minimal file only needs the ACME contact and
//! the domains to manage:
//!
//! ```toml
//! [acme]
//! contact_email = "admin@example.com"
//! domains = ["example.com"]
//! staging = true
//!
//! [storage]
//! state_dir = "/var/lib/tlsward"
//! ```
//!
//! Loading never touches the network or the certificate authority. Call
//! [`Config::validate`] after loading to run field checks, cross-field checks
//! and lints.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use validator::Validate;

pub mod validate;

pub use validate::{check_domain_name, DomainNameError, ValidationResult};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or has unknown fields
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Certificate authority and issuance settings
    #[serde(default)]
    #[validate(nested)]
    pub acme: AcmeSettings,

    /// Persistent state locations
    #[serde(default)]
    pub storage: StorageSettings,

    /// Renewal sweep settings
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerSettings,

    /// Retry/backoff around issuance
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// HTTP challenge port and HTTPS listener
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            domains = config.acme.domains.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        debug!(
            directory = %config.acme.directory_url(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// Runs field-level checks, cross-field checks and lints. Lint warnings
    /// are logged; errors are collected into a single [`ConfigError::Invalid`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut result = ValidationResult::new();

        if let Err(errors) = Validate::validate(self) {
            result.add_field_errors(&errors);
        }
        result.merge(validate::validate_domains(self));
        result.merge(validate::validate_timing(self));
        result.merge(validate::validate_listener(self));
        result.merge(validate::lint_config(self));

        for warning in &result.warnings {
            warn!(warning = %warning.message, "Configuration warning");
        }

        if result.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(result.error_summary()))
        }
    }
}

// ============================================================================
// ACME
// ============================================================================

/// Certificate authority and issuance settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AcmeSettings {
    /// Explicit ACME directory URL; overrides `staging`
    #[serde(default)]
    #[validate(url)]
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging directory when no URL is given
    #[serde(default)]
    pub staging: bool,

    /// Operator contact registered with the CA account
    #[serde(default)]
    #[validate(email)]
    pub contact_email: String,

    /// Domains managed by the scheduler
    #[serde(default)]
    pub domains: Vec<String>,

    /// Renew when the certificate expires within this many days
    #[serde(default = "default_renewal_threshold_days")]
    #[validate(range(min = 1, max = 89))]
    pub renewal_threshold_days: u32,

    /// Interval between authorization status polls
    #[serde(default = "default_challenge_poll_interval_secs")]
    #[validate(range(min = 1))]
    pub challenge_poll_interval_secs: u64,

    /// Give up on an authorization after this long
    #[serde(default = "default_challenge_timeout_secs")]
    #[validate(range(min = 1))]
    pub challenge_timeout_secs: u64,

    /// Give up waiting for an order to be issued after this long
    #[serde(default = "default_finalize_timeout_secs")]
    #[validate(range(min = 1))]
    pub finalize_timeout_secs: u64,
}

fn default_renewal_threshold_days() -> u32 { 30 }
fn default_challenge_poll_interval_secs() -> u64 { 3 }
fn default_challenge_timeout_secs() -> u64 { 180 }
fn default_finalize_timeout_secs() -> u64 { 180 }

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: None,
            staging: false,
            contact_email: String::new(),
            domains: Vec::new(),
            renewal_threshold_days: default_renewal_threshold_days(),
            challenge_poll_interval_secs: default_challenge_poll_interval_secs(),
            challenge_timeout_secs: default_challenge_timeout_secs(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
        }
    }
}

impl AcmeSettings {
    /// The directory URL to use, resolving `staging` when none is set
    pub fn directory_url(&self) -> &str {
        match (&self.directory_url, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETS_ENCRYPT_STAGING,
            (None, false) => LETS_ENCRYPT_PRODUCTION,
        }
    }

    pub fn challenge_poll_interval(&self) -> Duration {
        Duration::from_secs(self.challenge_poll_interval_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Persistent state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// Certificate record inventory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Serialized ACME account credentials (account key pair)
    #[serde(default)]
    pub account_key_path: Option<PathBuf>,

    /// Directory holding one PEM key pair per domain
    #[serde(default)]
    pub domain_key_dir: Option<PathBuf>,

    /// Directory for transient TLS material during a swap; defaults to the
    /// system temp dir
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/tlsward")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            account_key_path: None,
            domain_key_dir: None,
            staging_dir: None,
        }
    }
}

impl StorageSettings {
    pub fn account_key_path(&self) -> PathBuf {
        self.account_key_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("account.json"))
    }

    pub fn domain_key_dir(&self) -> PathBuf {
        self.domain_key_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("keys"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Renewal sweep settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    /// Time between sweeps
    #[serde(default = "default_check_interval_secs")]
    #[validate(range(min = 60))]
    pub check_interval_secs: u64,

    /// Delay before the first sweep after startup
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

fn default_check_interval_secs() -> u64 { 86_400 }
fn default_initial_delay_secs() -> u64 { 10 }

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

impl SchedulerSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Retry/backoff around issuance
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_secs() -> u64 { 5 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Minimum TLS protocol version offered by the HTTPS listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinTlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// HTTP challenge port and HTTPS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSettings {
    /// HTTPS listener address
    #[serde(default = "default_https_address")]
    pub https_address: SocketAddr,

    /// HTTP port serving challenges and redirects
    #[serde(default = "default_http_address")]
    pub http_address: SocketAddr,

    /// HTTPS port advertised in redirects (may differ behind NAT)
    #[serde(default = "default_public_https_port")]
    pub public_https_port: u16,

    #[serde(default)]
    pub min_tls_version: MinTlsVersion,

    /// Maximum wait for handshakes on a replaced configuration
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_https_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}
fn default_http_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}
fn default_public_https_port() -> u16 { 443 }
fn default_drain_timeout_secs() -> u64 { 30 }

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            https_address: default_https_address(),
            http_address: default_http_address(),
            public_https_port: default_public_https_port(),
            min_tls_version: MinTlsVersion::default(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ListenerSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
