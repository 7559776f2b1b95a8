//! Timing relationship checks

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::Config;

/// Validate intervals and timeouts against each other
pub fn validate_timing(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let acme = &config.acme;

    if acme.challenge_poll_interval_secs >= acme.challenge_timeout_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            format!(
                "challenge_poll_interval_secs ({}) must be shorter than challenge_timeout_secs ({})",
                acme.challenge_poll_interval_secs, acme.challenge_timeout_secs
            ),
        ));
    }

    let threshold_secs = u64::from(acme.renewal_threshold_days) * 86_400;
    if config.scheduler.check_interval_secs >= threshold_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            format!(
                "scheduler.check_interval_secs ({}) must be shorter than the renewal threshold ({} days)",
                config.scheduler.check_interval_secs, acme.renewal_threshold_days
            ),
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        assert!(validate_timing(&Config::default()).errors.is_empty());
    }

    #[test]
    fn test_poll_interval_longer_than_timeout() {
        let mut config = Config::default();
        config.acme.challenge_poll_interval_secs = 200;

        let result = validate_timing(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].category, ErrorCategory::Timing);
    }

    #[test]
    fn test_sweep_slower_than_threshold() {
        let mut config = Config::default();
        config.acme.renewal_threshold_days = 1;
        config.scheduler.check_interval_secs = 2 * 86_400;

        let result = validate_timing(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("renewal threshold")));
    }
}
