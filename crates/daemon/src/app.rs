//! Process wiring
//!
//! Builds every component from a validated [`Config`] and runs either the
//! long-lived daemon or a one-shot issuance.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{info, warn};

use tlsward_common::RetryPolicy;
use tlsward_config::Config;

use crate::acme::{
    AcmeClient, AcmeClientConfig, CertificateAuthority, CertificateIssuer, CertificateRecord,
    CertificateStore, ChallengeResponder, FileCertificateStore, InstantAcmeAuthority, KeyStore,
    RenewalScheduler, RetryingIssuer, StoreError,
};
use crate::http::ChallengeServer;
use crate::notify::{Notifier, TracingNotifier};
use crate::service::{CertificateService, ServiceError};
use crate::tls::{HttpsListener, TlsConfigError, TlsHotSwapManager, TlsSettings};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tls(#[from] TlsConfigError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("failed to bind {what} on {address}: {source}")]
    Bind {
        what: &'static str,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

/// Components shared by every command
pub struct App {
    config: Config,
    challenges: ChallengeResponder,
    store: Arc<dyn CertificateStore>,
    issuer: Arc<dyn CertificateIssuer>,
    notifier: Arc<dyn Notifier>,
}

impl App {
    /// Wire the production CA and file-backed inventory
    pub fn new(config: Config) -> Result<Self, AppError> {
        let store: Arc<dyn CertificateStore> =
            Arc::new(FileCertificateStore::open(&config.storage.state_dir)?);
        let authority = Arc::new(InstantAcmeAuthority::new(config.acme.directory_url()));
        Ok(Self::with_parts(config, authority, store, ChallengeResponder::new()))
    }

    /// Wire a custom CA, inventory and challenge table
    pub fn with_parts(
        config: Config,
        authority: Arc<dyn CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        challenges: ChallengeResponder,
    ) -> Self {
        let keys = Arc::new(KeyStore::new(
            config.storage.account_key_path(),
            config.storage.domain_key_dir(),
        ));
        let client = AcmeClient::new(
            AcmeClientConfig::from_settings(&config.acme),
            authority,
            Arc::clone(&store),
            keys,
            challenges.clone(),
        );
        let policy = RetryPolicy::new(
            config.retry.max_attempts,
            config.retry.base_delay(),
            config.retry.multiplier,
        );
        let issuer: Arc<dyn CertificateIssuer> = Arc::new(RetryingIssuer::new(client, policy));

        Self {
            config,
            challenges,
            store,
            issuer,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    pub fn challenges(&self) -> &ChallengeResponder {
        &self.challenges
    }

    /// Every stored record, sorted by domain
    pub async fn status(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        self.store.list().await
    }

    /// Issue or renew one domain without a TLS listener
    ///
    /// Serves the HTTP challenge port only for the duration of the flow.
    pub async fn issue_once(&self, domain: &str) -> Result<CertificateRecord, AppError> {
        let (stop, stopped) = watch::channel(false);
        let http = self.bind_challenge_port().await?;
        let http_task = tokio::spawn(http.serve(stopped));

        let service = CertificateService::new(
            Arc::clone(&self.issuer),
            Arc::clone(&self.store),
            None,
            Arc::clone(&self.notifier),
        );
        let result = service.apply(domain).await;

        let _ = stop.send(true);
        http_task.await?;
        Ok(result?)
    }

    /// Run the daemon until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let tls = Arc::new(TlsHotSwapManager::new(TlsSettings::from_config(&self.config))?);
        let service = Arc::new(CertificateService::new(
            Arc::clone(&self.issuer),
            Arc::clone(&self.store),
            Some(Arc::clone(&tls)),
            Arc::clone(&self.notifier),
        ));

        service.activate_stored(&self.config.acme.domains).await;

        let http = self.bind_challenge_port().await?;
        let https_address = self.config.listener.https_address;
        let https = HttpsListener::bind(https_address, tls.live())
            .await
            .map_err(|source| AppError::Bind {
                what: "HTTPS listener",
                address: https_address,
                source,
            })?;

        let (stop, stopped) = watch::channel(false);
        let http_task = tokio::spawn(http.serve(stopped.clone()));
        let https_task = tokio::spawn(https.serve(stopped));

        let scheduler = RenewalScheduler::new(
            service,
            self.config.acme.domains.clone(),
            chrono::Duration::days(i64::from(self.config.acme.renewal_threshold_days)),
        )
        .with_interval(self.config.scheduler.check_interval())
        .with_initial_delay(self.config.scheduler.initial_delay())
        .start();

        info!(
            domains = self.config.acme.domains.len(),
            https = %https_address,
            http = %self.config.listener.http_address,
            "tlsward running"
        );

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                warn!("Shutdown sender dropped, stopping");
                break;
            }
        }

        info!("Shutting down");
        scheduler.shutdown().await?;
        let _ = stop.send(true);
        http_task.await?;
        https_task.await?;
        Ok(())
    }

    async fn bind_challenge_port(&self) -> Result<ChallengeServer, AppError> {
        let address = self.config.listener.http_address;
        ChallengeServer::bind(address, self.challenges.clone(), self.config.listener.public_https_port)
            .await
            .map_err(|source| AppError::Bind {
                what: "HTTP challenge port",
                address,
                source,
            })
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("domains", &self.config.acme.domains)
            .field("directory", &self.config.acme.directory_url())
            .finish()
    }
}
