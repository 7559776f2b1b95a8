//! HTTP-01 challenge responses
//!
//! The CA validates domain control by fetching
//! `/.well-known/acme-challenge/<token>` over plain HTTP and comparing the
//! body with the key authorization it expects. [`ChallengeResponder`] holds the
//! token -> key authorization pairs for every in-flight authorization so the
//! challenge port can answer those requests.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared table of pending HTTP-01 challenges
///
/// Cloning is cheap and every clone sees the same table, so the issuance
/// flow and the HTTP handler can each hold their own handle.
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponder {
    /// token -> key authorization
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a challenge response
    ///
    /// Registering a token that is already present replaces its key
    /// authorization.
    pub fn register(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Publish a challenge response for as long as the returned guard lives
    pub fn register_scoped(&self, token: &str, key_authorization: &str) -> ChallengeRegistration {
        self.register(token, key_authorization);
        ChallengeRegistration {
            responder: self.clone(),
            token: token.to_string(),
        }
    }

    /// Key authorization for a token, if one is registered
    pub fn lookup(&self, token: &str) -> Option<String> {
        let found = self.challenges.get(token).map(|v| v.value().clone());
        trace!(token = %token, found = found.is_some(), "Challenge lookup");
        found
    }

    /// Withdraw a challenge response
    ///
    /// Unknown tokens are ignored.
    pub fn deregister(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Deregistered HTTP-01 challenge");
        }
    }

    /// Token portion of a challenge request path
    ///
    /// Returns `None` when the path is outside the challenge prefix or the
    /// token is empty.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty())
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Drop every pending challenge
    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared pending HTTP-01 challenges");
        }
    }
}

/// Keeps a challenge published until dropped
///
/// Dropping the guard deregisters the token, so every exit path out of an
/// authorization (success, CA rejection, timeout, cancellation) withdraws
/// the response.
#[derive(Debug)]
#[must_use = "the challenge is withdrawn as soon as the registration is dropped"]
pub struct ChallengeRegistration {
    responder: ChallengeResponder,
    token: String,
}

impl ChallengeRegistration {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for ChallengeRegistration {
    fn drop(&mut self) {
        self.responder.deregister(&self.token);
    }
}
