//! Issuance flow against the in-process CA

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use common::{expected_key_authorization, record, Harness, MockAuthority, Validation, ACCOUNT_ID};
use tlsward_config::{Config, MinTlsVersion};
use tlsward_daemon::acme::{AcmeClientConfig, CertificateStore, ChallengeResponder, FileCertificateStore};
use tlsward_daemon::{
    AcmeError, App, CertificateService, CertificateStatus, TlsHotSwapManager, TlsSettings,
    TracingNotifier,
};

#[tokio::test]
async fn first_issuance_stores_record_and_activates_it() {
    let h = Harness::new();
    let staging = TempDir::new().unwrap();
    let tls = Arc::new(
        TlsHotSwapManager::new(TlsSettings {
            min_tls_version: MinTlsVersion::Tls12,
            staging_dir: staging.path().to_path_buf(),
            drain_timeout: Duration::from_secs(1),
            placeholder_names: vec!["example.test".to_string()],
        })
        .unwrap(),
    );
    let store: Arc<dyn CertificateStore> = h.store.clone();
    let service = CertificateService::new(
        Arc::new(h.client(Harness::fast_config())),
        Arc::clone(&store),
        Some(Arc::clone(&tls)),
        Arc::new(TracingNotifier),
    );

    let record = service.apply("example.test").await.unwrap();

    assert_eq!(record.domain, "example.test");
    assert_eq!(record.status, CertificateStatus::Active);
    assert_eq!(record.account_id.as_deref(), Some(ACCOUNT_ID));
    assert_eq!(record.days_remaining(Utc::now()), 89);
    assert!(record.expires_at > record.issued_at);
    assert_eq!(store.get("example.test").await.unwrap(), Some(record.clone()));

    // Account and domain keys were generated on first use
    assert!(h.keys.account_key_path().exists());
    assert!(h.keys.domain_key_path("example.test").exists());

    // The CA saw the key authorization while validating, and it is gone now
    let observed = h.authority.observed();
    assert_eq!(observed.len(), 1);
    let (token, served) = &observed[0];
    assert_eq!(served.as_deref(), Some(expected_key_authorization(token).as_str()));
    assert_eq!(h.challenges.lookup(token), None);
    assert_eq!(h.challenges.pending_count(), 0);

    let live = tls.current();
    assert_eq!(live.generation(), 1);
    assert!(!live.is_placeholder());
    assert_eq!(live.names(), ["example.test".to_string()]);
}

#[tokio::test]
async fn second_call_within_validity_does_not_contact_ca() {
    let h = Harness::new();
    let client = h.client(Harness::fast_config());

    let first = client.issue_or_renew("example.test").await.unwrap();
    let second = client.issue_or_renew("example.test").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.authority.orders_created(), 1);
}

#[tokio::test]
async fn expiring_record_is_renewed_with_the_same_domain_key() {
    let h = Harness::new();
    let key_pem = h.keys.domain_key("renew.test").await.unwrap().serialize_pem();
    h.store
        .upsert(record("renew.test", CertificateStatus::Active, 5))
        .await
        .unwrap();

    let client = h.client(Harness::fast_config());
    let renewed = client.issue_or_renew("renew.test").await.unwrap();

    assert_eq!(h.authority.orders_created(), 1);
    assert_eq!(renewed.private_key_pem, key_pem);
    assert_eq!(renewed.days_remaining(Utc::now()), 89);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn expired_record_is_reissued() {
    let h = Harness::new();
    h.store
        .upsert(record("old.test", CertificateStatus::Expired, 60))
        .await
        .unwrap();

    let client = h.client(Harness::fast_config());
    let record = client.issue_or_renew("old.test").await.unwrap();

    assert_eq!(record.status, CertificateStatus::Active);
    assert_eq!(h.authority.orders_created(), 1);
}

#[tokio::test]
async fn invalid_authorization_withdraws_token_and_stores_nothing() {
    let h = Harness::new();
    h.authority.set_validation(Validation::Invalid);
    let client = h.client(Harness::fast_config());

    let err = client.issue_or_renew("example.test").await.unwrap_err();

    assert!(matches!(err, AcmeError::AuthorizationFailed { .. }), "{err}");
    assert!(!err.is_retriable());
    assert_eq!(h.challenges.pending_count(), 0);
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stuck_authorization_times_out() {
    let h = Harness::new();
    h.authority.set_validation(Validation::NeverResolves);
    let client = h.client(AcmeClientConfig {
        contact: vec!["ops@example.test".to_string()],
        ..AcmeClientConfig::default()
    });

    let start = tokio::time::Instant::now();
    let err = client.issue_or_renew("example.test").await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, AcmeError::AuthorizationTimeout { .. }), "{err}");
    assert!(err.is_retriable());
    assert!(elapsed >= Duration::from_secs(180), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(181), "{elapsed:?}");
    assert_eq!(h.challenges.pending_count(), 0);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn malformed_domain_never_reaches_ca() {
    let h = Harness::new();
    let client = h.client(Harness::fast_config());

    for domain in ["", "bad domain", "*.example.test", "-lead.example.test"] {
        let err = client.issue_or_renew(domain).await.unwrap_err();
        assert!(matches!(err, AcmeError::InvalidDomain { .. }), "{domain}: {err}");
        assert!(!err.is_retriable());
    }

    assert_eq!(h.authority.accounts_created(), 0);
    assert_eq!(h.authority.orders_created(), 0);
}

#[tokio::test]
async fn account_is_registered_once_and_restored_later() {
    let h = Harness::new();

    h.client(Harness::fast_config())
        .issue_or_renew("a.test")
        .await
        .unwrap();
    assert_eq!(h.authority.accounts_created(), 1);

    // A new process restores the persisted account
    h.client(Harness::fast_config())
        .issue_or_renew("b.test")
        .await
        .unwrap();
    assert_eq!(h.authority.accounts_created(), 1);
    assert_eq!(h.authority.accounts_restored(), 1);
}

#[tokio::test]
async fn one_shot_issue_persists_to_file_store() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.acme.contact_email = "ops@example.test".to_string();
    config.acme.challenge_poll_interval_secs = 1;
    config.storage.state_dir = dir.path().to_path_buf();
    config.listener.http_address = "127.0.0.1:0".parse().unwrap();

    let store: Arc<dyn CertificateStore> =
        Arc::new(FileCertificateStore::open(&config.storage.state_dir).unwrap());
    let challenges = ChallengeResponder::new();
    let authority = MockAuthority::new(&config.storage.domain_key_dir(), challenges.clone());
    let app = App::with_parts(config, Arc::new(authority.clone()), store, challenges);

    let record = app.issue_once("Example.Test").await.unwrap();

    assert_eq!(record.domain, "example.test");
    let listed = app.status().await.unwrap();
    assert_eq!(listed, vec![record]);
    assert!(dir.path().join("domains").join("example.test.json").exists());
    assert_eq!(authority.orders_created(), 1);
    assert_eq!(app.challenges().pending_count(), 0);
}
