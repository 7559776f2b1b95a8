//! Certificate authority seam
//!
//! [`AcmeClient`](super::AcmeClient) drives issuance through these traits so
//! the protocol state machine does not depend on a particular ACME library.
//! [`InstantAcmeAuthority`] is the production implementation.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, NewAccount, NewOrder, Order,
};
use serde::Deserialize;
use tracing::{debug, info, trace};

use super::error::AcmeError;

/// Authorization state as seen by the issuance flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    /// The CA is validating the challenge
    Processing,
    Valid,
    /// Rejected, revoked, expired or deactivated
    Invalid,
}

/// Order state as seen by the issuance flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An HTTP-01 challenge offered for one authorization
#[derive(Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: String,
    pub key_authorization: String,
    /// Challenge URL to signal readiness on
    pub url: String,
}

impl std::fmt::Debug for Http01Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http01Challenge")
            .field("token", &self.token)
            .field("key_authorization", &"<redacted>")
            .field("url", &self.url)
            .finish()
    }
}

/// One domain's authorization within an order
#[derive(Debug, Clone)]
pub struct AuthorizationInfo {
    pub domain: String,
    pub status: AuthorizationStatus,
    /// Absent when the CA did not offer HTTP-01
    pub http01: Option<Http01Challenge>,
}

/// Entry point to a CA
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Register a new account, agreeing to the terms of service
    ///
    /// Returns the account and its serialized credentials for persistence.
    async fn create_account(
        &self,
        contact: &[String],
    ) -> Result<(Box<dyn AcmeAccount>, String), AcmeError>;

    /// Rebuild an account from previously serialized credentials
    async fn restore_account(&self, credentials: &str) -> Result<Box<dyn AcmeAccount>, AcmeError>;
}

/// A registered CA account
#[async_trait]
pub trait AcmeAccount: Send + Sync {
    fn id(&self) -> &str;

    /// Create an order for exactly one DNS identifier
    async fn new_order(&self, domain: &str) -> Result<Box<dyn AcmeOrder>, AcmeError>;
}

/// An order in flight
#[async_trait]
pub trait AcmeOrder: Send {
    fn id(&self) -> &str;

    async fn authorizations(&mut self) -> Result<Vec<AuthorizationInfo>, AcmeError>;

    /// Ask the CA to validate a challenge
    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError>;

    /// Current status of the authorization for `domain`
    async fn refresh_authorization(&mut self, domain: &str)
        -> Result<AuthorizationStatus, AcmeError>;

    /// Submit the DER-encoded CSR
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError>;

    /// Re-fetch the order and report its status
    async fn poll_status(&mut self) -> Result<OrderStatus, AcmeError>;

    /// PEM chain once the order is valid
    async fn certificate(&mut self) -> Result<Option<String>, AcmeError>;
}

/// [`CertificateAuthority`] backed by `instant-acme`
#[derive(Debug, Clone)]
pub struct InstantAcmeAuthority {
    directory_url: String,
}

impl InstantAcmeAuthority {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }
}

#[async_trait]
impl CertificateAuthority for InstantAcmeAuthority {
    async fn create_account(
        &self,
        contact: &[String],
    ) -> Result<(Box<dyn AcmeAccount>, String), AcmeError> {
        let contact: Vec<String> = contact
            .iter()
            .map(|c| {
                if c.starts_with("mailto:") {
                    c.clone()
                } else {
                    format!("mailto:{}", c)
                }
            })
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::AccountError(format!("account registration failed: {}", e)))?;

        let json = serde_json::to_string(&credentials)
            .map_err(|e| AcmeError::AccountError(format!("cannot serialize credentials: {}", e)))?;
        let id = account_id(&json)?;

        info!(
            directory = %self.directory_url,
            account_id = %id,
            "Registered CA account"
        );

        Ok((Box::new(InstantAcmeAccount { account, id }), json))
    }

    async fn restore_account(&self, credentials: &str) -> Result<Box<dyn AcmeAccount>, AcmeError> {
        let id = account_id(credentials)?;
        let parsed: AccountCredentials = serde_json::from_str(credentials)
            .map_err(|e| AcmeError::AccountError(format!("stored credentials are unreadable: {}", e)))?;
        let account = Account::from_credentials(parsed)
            .await
            .map_err(|e| AcmeError::AccountError(format!("cannot restore account: {}", e)))?;

        debug!(account_id = %id, "Restored CA account");
        Ok(Box::new(InstantAcmeAccount { account, id }))
    }
}

/// The credentials type keeps the account URL private, so read it from the
/// serialized form.
fn account_id(credentials_json: &str) -> Result<String, AcmeError> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: String,
    }
    serde_json::from_str::<IdOnly>(credentials_json)
        .map(|c| c.id)
        .map_err(|e| AcmeError::AccountError(format!("credentials carry no account id: {}", e)))
}

struct InstantAcmeAccount {
    account: Account,
    id: String,
}

#[async_trait]
impl AcmeAccount for InstantAcmeAccount {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_order(&self, domain: &str) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderError(format!("cannot create order for {}: {}", domain, e)))?;

        let id = order.url().to_string();
        debug!(domain = %domain, order = %id, "Created order");
        Ok(Box::new(InstantAcmeOrder { order, id }))
    }
}

struct InstantAcmeOrder {
    order: Order,
    id: String,
}

impl InstantAcmeOrder {
    async fn fetch_authorizations(&mut self) -> Result<Vec<instant_acme::Authorization>, AcmeError> {
        self.order
            .authorizations()
            .await
            .map_err(|e| AcmeError::OrderError(format!("cannot fetch authorizations: {}", e)))
    }
}

fn identifier_domain(identifier: &Identifier) -> String {
    #[allow(unreachable_patterns)]
    match identifier {
        Identifier::Dns(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

fn map_authorization(status: &instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    use instant_acme::AuthorizationStatus as Upstream;

    match status {
        Upstream::Valid => AuthorizationStatus::Valid,
        Upstream::Pending => AuthorizationStatus::Pending,
        _ => AuthorizationStatus::Invalid,
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn authorizations(&mut self) -> Result<Vec<AuthorizationInfo>, AcmeError> {
        let authorizations = self.fetch_authorizations().await?;

        Ok(authorizations
            .iter()
            .map(|authz| {
                let http01 = authz
                    .challenges
                    .iter()
                    .find(|c| c.r#type == ChallengeType::Http01)
                    .map(|c| Http01Challenge {
                        token: c.token.clone(),
                        key_authorization: self.order.key_authorization(c).as_str().to_string(),
                        url: c.url.clone(),
                    });
                AuthorizationInfo {
                    domain: identifier_domain(&authz.identifier),
                    status: map_authorization(&authz.status),
                    http01,
                }
            })
            .collect())
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), AcmeError> {
        self.order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(|e| AcmeError::OrderError(format!("cannot trigger validation: {}", e)))
    }

    async fn refresh_authorization(
        &mut self,
        domain: &str,
    ) -> Result<AuthorizationStatus, AcmeError> {
        let authorizations = self.fetch_authorizations().await?;
        let authz = authorizations
            .iter()
            .find(|a| identifier_domain(&a.identifier).eq_ignore_ascii_case(domain))
            .ok_or_else(|| {
                AcmeError::OrderError(format!("order has no authorization for {}", domain))
            })?;

        let status = map_authorization(&authz.status);
        trace!(domain = %domain, status = ?status, "Polled authorization");
        Ok(status)
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        self.order
            .finalize(csr_der)
            .await
            .map_err(|e| AcmeError::FinalizeError(format!("CA rejected the CSR: {}", e)))
    }

    async fn poll_status(&mut self) -> Result<OrderStatus, AcmeError> {
        use instant_acme::OrderStatus as Upstream;

        let state = self
            .order
            .refresh()
            .await
            .map_err(|e| AcmeError::FinalizeError(format!("cannot refresh order: {}", e)))?;

        #[allow(unreachable_patterns)]
        let status = match state.status {
            Upstream::Pending => OrderStatus::Pending,
            Upstream::Ready => OrderStatus::Ready,
            Upstream::Processing => OrderStatus::Processing,
            Upstream::Valid => OrderStatus::Valid,
            _ => OrderStatus::Invalid,
        };
        Ok(status)
    }

    async fn certificate(&mut self) -> Result<Option<String>, AcmeError> {
        self.order
            .certificate()
            .await
            .map_err(|e| AcmeError::CertFetchError(format!("cannot download certificate: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_from_credentials() {
        let json = r#"{"id":"https://ca.test/acct/7","key_pkcs8":"AAAA","directory":"https://ca.test/dir"}"#;
        assert_eq!(account_id(json).unwrap(), "https://ca.test/acct/7");
    }

    #[test]
    fn test_account_id_missing() {
        let err = account_id("{}").unwrap_err();
        assert!(matches!(err, AcmeError::AccountError(_)));
    }

    #[test]
    fn test_authorization_status_mapping() {
        use instant_acme::AuthorizationStatus as Upstream;

        assert_eq!(map_authorization(&Upstream::Pending), AuthorizationStatus::Pending);
        assert_eq!(map_authorization(&Upstream::Valid), AuthorizationStatus::Valid);
        assert_eq!(map_authorization(&Upstream::Invalid), AuthorizationStatus::Invalid);
    }

    #[test]
    fn test_http01_debug_redacts_key_authorization() {
        let challenge = Http01Challenge {
            token: "tok".into(),
            key_authorization: "tok.thumbprint".into(),
            url: "https://ca.test/chall/1".into(),
        };
        let rendered = format!("{:?}", challenge);
        assert!(rendered.contains("tok"));
        assert!(!rendered.contains("thumbprint"));
    }
}
