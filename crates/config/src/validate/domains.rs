//! Domain name validation
//!
//! Only plain DNS names are accepted: HTTP-01 cannot prove control of
//! wildcards, and IP identifiers are not supported.

use thiserror::Error;

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::Config;

/// Maximum length of a full domain name
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

/// Why a domain name was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainNameError {
    #[error("domain cannot be empty")]
    Empty,
    #[error("domain cannot contain whitespace")]
    Whitespace,
    #[error("domain cannot start or end with a dot")]
    EdgeDot,
    #[error("wildcard domains cannot be validated over HTTP-01")]
    Wildcard,
    #[error("domain exceeds 253 characters")]
    TooLong,
    #[error("invalid label '{0}'")]
    InvalidLabel(String),
}

/// Check that `domain` is a syntactically valid DNS name
pub fn check_domain_name(domain: &str) -> Result<(), DomainNameError> {
    if domain.is_empty() {
        return Err(DomainNameError::Empty);
    }
    if domain.chars().any(char::is_whitespace) {
        return Err(DomainNameError::Whitespace);
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(DomainNameError::EdgeDot);
    }
    if domain.contains('*') {
        return Err(DomainNameError::Wildcard);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(DomainNameError::TooLong);
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(DomainNameError::InvalidLabel(label.to_string()));
        }
    }

    Ok(())
}

/// Validate configured domains
pub fn validate_domains(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = std::collections::HashSet::new();

    for domain in &config.acme.domains {
        if let Err(e) = check_domain_name(domain) {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("Domain '{}' is invalid: {}", domain, e),
            ));
        }

        if !seen.insert(domain.to_ascii_lowercase()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("Domain '{}' is listed more than once", domain),
            ));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert!(check_domain_name("example.com").is_ok());
        assert!(check_domain_name("sub.example-site.co.uk").is_ok());
        assert!(check_domain_name("localhost").is_ok());
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert_eq!(check_domain_name(""), Err(DomainNameError::Empty));
        assert_eq!(
            check_domain_name("invalid domain.com"),
            Err(DomainNameError::Whitespace)
        );
        assert_eq!(check_domain_name(".example.com"), Err(DomainNameError::EdgeDot));
        assert_eq!(check_domain_name("example.com."), Err(DomainNameError::EdgeDot));
        assert_eq!(check_domain_name("*.example.com"), Err(DomainNameError::Wildcard));
        assert!(matches!(
            check_domain_name("a..b"),
            Err(DomainNameError::InvalidLabel(_))
        ));
        assert!(matches!(
            check_domain_name("-bad.example.com"),
            Err(DomainNameError::InvalidLabel(_))
        ));
        assert!(matches!(
            check_domain_name("under_score.com"),
            Err(DomainNameError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_rejects_long_label() {
        let label = "a".repeat(64);
        assert!(check_domain_name(&format!("{}.com", label)).is_err());
    }

    #[test]
    fn test_duplicate_domains() {
        let mut config = Config::default();
        config.acme.domains = vec!["Example.com".to_string(), "example.com".to_string()];

        let result = validate_domains(&config);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("more than once"));
    }
}
