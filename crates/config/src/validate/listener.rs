//! Listener address validation

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::Config;

/// Validate that the HTTP and HTTPS ports do not collide
pub fn validate_listener(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let listener = &config.listener;

    if listener.http_address == listener.https_address {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            format!(
                "http_address and https_address are both {}",
                listener.http_address
            ),
        ));
    }

    if listener.public_https_port == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            "public_https_port cannot be 0",
        ));
    }

    result
}
