//! Configuration validation
//!
//! Field-level rules come from `validator` derives on the config structs.
//! The checks here cover what a single field cannot express: domain name
//! syntax, timing relationships between sections, listener address clashes,
//! and lints that only warn.

mod domains;
mod lint;
mod listener;
mod timing;

pub use domains::{check_domain_name, validate_domains, DomainNameError};
pub use lint::lint_config;
pub use listener::validate_listener;
pub use timing::validate_timing;

use std::fmt;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A single field violated its declared rule
    Field,
    /// ACME settings (domains, directory)
    Acme,
    /// Poll intervals, timeouts and thresholds
    Timing,
    /// Listener addresses and ports
    Listener,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Field => "field",
            ErrorCategory::Acme => "acme",
            ErrorCategory::Timing => "timing",
            ErrorCategory::Listener => "listener",
        };
        f.write_str(name)
    }
}

/// A validation error that makes the configuration unusable
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// A finding worth reporting that does not block startup
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Record every failure from a `validator` run, with dotted field paths
    pub fn add_field_errors(&mut self, errors: &validator::ValidationErrors) {
        let mut messages = Vec::new();
        collect_field_errors("", errors, &mut messages);
        for message in messages {
            self.add_error(ValidationError::new(ErrorCategory::Field, message));
        }
    }

    /// All error messages joined into one line
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("[{}] {}", e.category, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn collect_field_errors(prefix: &str, errors: &validator::ValidationErrors, out: &mut Vec<String>) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            format!("{}", field)
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let reason = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string());
                    out.push(format!("{}: {}", path, reason));
                }
            }
            ValidationErrorsKind::Struct(inner) => collect_field_errors(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_field_errors(&format!("{}[{}]", path, index), inner, out);
                }
            }
        }
    }
}
