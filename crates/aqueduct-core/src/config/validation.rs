//! Configuration validation utilities
//!
//! The validator accumulates every field problem so a caller sees all of
//! them at once; the combined report becomes a single
//! [`AmqpError::Configuration`].

use crate::AmqpError;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Value is required but missing
    #[error("Field '{field}' is required but missing")]
    Required { field: String },
    /// Value format is invalid
    #[error("Field '{field}' has invalid format. Expected: {expected}, got: '{actual}'")]
    InvalidFormat {
        field: String,
        expected: String,
        actual: String,
    },
    /// Custom validation failed
    #[error("Field '{field}': {message}")]
    Custom { field: String, message: String },
}

impl From<ValidationError> for AmqpError {
    fn from(err: ValidationError) -> Self {
        AmqpError::configuration(err.to_string())
    }
}

/// Configuration validator that accumulates validation rules
#[derive(Debug, Default)]
pub struct ConfigValidator {
    errors: Vec<ValidationError>,
}

impl ConfigValidator {
    /// Create a new validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate that a value is present
    pub fn required<T>(&mut self, field_name: &str, value: &Option<T>) -> &mut Self {
        if value.is_none() {
            self.errors.push(ValidationError::Required {
                field: field_name.to_string(),
            });
        }
        self
    }

    /// Validate that a string is present and not blank
    pub fn non_empty(&mut self, field_name: &str, value: Option<&str>) -> &mut Self {
        if value.map_or(true, |v| v.trim().is_empty()) {
            self.errors.push(ValidationError::Required {
                field: field_name.to_string(),
            });
        }
        self
    }

    /// Validate a hostname: ASCII letters, digits, '-' and '.', not starting
    /// or ending with '-' or '.'
    pub fn hostname(&mut self, field_name: &str, value: &str) -> &mut Self {
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !value.starts_with(['-', '.'])
            && !value.ends_with(['-', '.']);

        if !valid {
            self.errors.push(ValidationError::InvalidFormat {
                field: field_name.to_string(),
                expected: "hostname".to_string(),
                actual: value.to_string(),
            });
        }
        self
    }

    /// Validate using a custom predicate
    pub fn custom<T, F>(
        &mut self,
        field_name: &str,
        value: &T,
        predicate: F,
        message: &str,
    ) -> &mut Self
    where
        F: FnOnce(&T) -> bool,
    {
        if !predicate(value) {
            self.errors.push(ValidationError::Custom {
                field: field_name.to_string(),
                message: message.to_string(),
            });
        }
        self
    }

    /// Record the outcome of a nested check that already produced an error
    pub fn check(&mut self, field_name: &str, outcome: Result<(), AmqpError>) -> &mut Self {
        if let Err(err) = outcome {
            self.errors.push(ValidationError::Custom {
                field: field_name.to_string(),
                message: err.to_string(),
            });
        }
        self
    }

    /// Get all validation errors
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Finish validation, joining every recorded problem into one error
    pub fn finish(self) -> Result<(), AmqpError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let report = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(AmqpError::configuration(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_all_errors() {
        let mut validator = ConfigValidator::new();
        validator
            .non_empty("hostname", None)
            .non_empty("scope", Some("  "))
            .custom("idle_timeout", &0u64, |secs| *secs > 0, "must be greater than zero");

        assert_eq!(validator.errors().len(), 3);
        let err = validator.finish().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("hostname"));
        assert!(message.contains("scope"));
        assert!(message.contains("idle_timeout"));
    }

    #[test]
    fn test_failed_check_keeps_field_name() {
        let mut validator = ConfigValidator::new();
        validator.check(
            "retry_options",
            Err(AmqpError::configuration("retry delay must be greater than zero")),
        );

        assert_eq!(
            validator.errors()[0],
            ValidationError::Custom {
                field: "retry_options".to_string(),
                message: "Configuration error: retry delay must be greater than zero".to_string()
            }
        );
    }

    #[test]
    fn test_hostname_format() {
        let mut validator = ConfigValidator::new();
        validator
            .hostname("ok", "contoso.servicebus.windows.net")
            .hostname("bad", "-contoso")
            .hostname("worse", "conto so");

        assert_eq!(validator.errors().len(), 2);
    }
}
