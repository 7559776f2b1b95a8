//! Background certificate renewal scheduler
//!
//! Periodically sweeps the certificate inventory and renews whatever is
//! about to expire. One domain failing never stops the sweep.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::StoreError;
use super::store::{CertificateStatus, CertificateStore};
use crate::service::CertificateService;

/// Default sweep interval (daily)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Minimum sweep interval
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default delay before the first sweep
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Domains that now hold a fresh certificate
    pub renewed: Vec<String>,
    /// Domains whose renewal failed this sweep
    pub failed: Vec<String>,
    /// Configured domains whose certificate was still fresh
    pub skipped: usize,
    /// Records found past expiry and marked EXPIRED
    pub expired: usize,
}

/// Periodic renewal over the certificate inventory
pub struct RenewalScheduler {
    service: Arc<CertificateService>,
    store: Arc<dyn CertificateStore>,
    /// Domains that must hold a certificate even without a stored record
    domains: Vec<String>,
    renewal_threshold: chrono::Duration,
    check_interval: Duration,
    initial_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(
        service: Arc<CertificateService>,
        domains: Vec<String>,
        renewal_threshold: chrono::Duration,
    ) -> Self {
        let store = Arc::clone(service.store());
        Self {
            service,
            store,
            domains: domains.iter().map(|d| d.trim().to_ascii_lowercase()).collect(),
            renewal_threshold,
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }

    /// Set the sweep interval, clamped to a one-minute minimum
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one sweep
    ///
    /// Marks ACTIVE records already past expiry as EXPIRED, then renews every
    /// ACTIVE record expiring within the threshold plus every configured
    /// domain without an ACTIVE record. A record the store cannot read fails
    /// only its own domain; only a failure to list the inventory aborts the
    /// sweep.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let expiring = self
            .store
            .find_expiring_active(now + self.renewal_threshold)
            .await?;

        let mut candidates = BTreeSet::new();
        for record in &expiring {
            if record.is_expired(now) {
                warn!(
                    domain = %record.domain,
                    expired_at = %record.expires_at,
                    "Certificate already expired"
                );
                match self
                    .store
                    .set_status(&record.domain, CertificateStatus::Expired)
                    .await
                {
                    Ok(marked) => report.expired += marked,
                    // Renewal below still supersedes the record
                    Err(e) => self.service.report_store_failure(&record.domain, &e).await,
                }
            }
            candidates.insert(record.domain.clone());
        }

        for domain in &self.domains {
            if candidates.contains(domain) {
                continue;
            }
            match self.store.get(domain).await {
                Ok(Some(record)) if record.status == CertificateStatus::Active => {
                    debug!(domain = %domain, expires_at = %record.expires_at, "Certificate is still valid");
                    report.skipped += 1;
                }
                Ok(_) => {
                    candidates.insert(domain.clone());
                }
                Err(e) => {
                    self.service.report_store_failure(domain, &e).await;
                    report.failed.push(domain.clone());
                }
            }
        }

        info!(
            candidates = candidates.len(),
            skipped = report.skipped,
            "Checking certificates for renewal"
        );

        for domain in candidates {
            match self.service.apply(&domain).await {
                Ok(record) => {
                    info!(domain = %domain, expires_at = %record.expires_at, "Certificate renewed");
                    report.renewed.push(domain);
                }
                Err(e) => {
                    // Already notified by the service; keep going
                    error!(domain = %domain, error = %e, "Certificate renewal failed");
                    report.failed.push(domain);
                }
            }
        }

        Ok(report)
    }

    /// Spawn the periodic sweep loop
    pub fn start(self) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                check_interval_secs = self.check_interval.as_secs(),
                initial_delay_secs = self.initial_delay.as_secs(),
                "Starting certificate renewal scheduler"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.initial_delay) => {}
                _ = stopped.changed() => {
                    info!("Renewal scheduler stopped before first sweep");
                    return;
                }
            }
            self.sweep().await;

            let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep().await,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Renewal scheduler stopped");
        });

        SchedulerHandle { stop, task }
    }

    async fn sweep(&self) {
        debug!("Running scheduled certificate renewal sweep");
        match self.run_once().await {
            Ok(report) => info!(
                renewed = report.renewed.len(),
                failed = report.failed.len(),
                skipped = report.skipped,
                expired = report.expired,
                "Renewal sweep finished"
            ),
            Err(e) => error!(error = %e, "Renewal sweep could not read the certificate store"),
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("domains", &self.domains)
            .field("renewal_threshold_days", &self.renewal_threshold.num_days())
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

/// Lifecycle handle for a running [`RenewalScheduler`]
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to stop; a sweep already running finishes first
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }

    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.stop();
        self.join().await
    }
}
