//! Configuration linting
//!
//! Flags settings that work but are likely mistakes in production.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint configuration for likely mistakes
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.domains.is_empty() {
        result.add_warning(ValidationWarning::new(
            "No domains configured; certificates will only be issued on demand",
        ));
    }

    if config.acme.staging && config.acme.directory_url.is_some() {
        result.add_warning(ValidationWarning::new(
            "acme.staging is ignored because acme.directory_url is set",
        ));
    }

    // Let's Encrypt issues 90-day certificates; renewing with less than a
    // week left leaves no room for retries across sweeps
    if config.acme.renewal_threshold_days < 7 {
        result.add_warning(ValidationWarning::new(format!(
            "renewal_threshold_days is {} (at least 7 recommended)",
            config.acme.renewal_threshold_days
        )));
    }

    if config.retry.max_attempts == 1 {
        result.add_warning(ValidationWarning::new(
            "retry.max_attempts is 1; transient CA errors will not be retried",
        ));
    }

    if config.listener.https_address.port() == 443 && config.listener.public_https_port != 443 {
        result.add_warning(ValidationWarning::new(format!(
            "Listener binds 443 but redirects advertise port {}",
            config.listener.public_https_port
        )));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lint_empty_domains() {
        let config = Config::default();
        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("No domains")));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_lint_short_threshold() {
        let mut config = Config::default();
        config.acme.renewal_threshold_days = 3;
        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("renewal_threshold_days")));
    }
}
