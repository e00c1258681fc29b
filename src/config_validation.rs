//! Payload validation.
//!
//! Field-level validators with detailed error messages, and a context that
//! collects every problem in a payload so they can be reported together.

use regex::Regex;
use thiserror::Error;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}' is required but not provided")]
    RequiredField { field: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Fields '{first}' and '{second}' conflict: {message}")]
    Conflict {
        first: String,
        second: String,
        message: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects validation errors across a whole payload.
#[derive(Debug, Default)]
pub struct ValidationContext {
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validation error.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Record the outcome of a validator, keeping the value on success.
    pub fn check<T>(&mut self, result: ValidationResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.add_error(e);
                None
            }
        }
    }

    /// Require an optional field to be present and non-empty.
    pub fn require<'a>(&mut self, field: &str, value: Option<&'a str>) -> Option<&'a str> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => Some(v),
            None => {
                self.add_error(ValidationError::RequiredField {
                    field: field.to_string(),
                });
                None
            }
        }
    }

    /// Consume the context and return a result. A single error is returned
    /// as-is; several are joined into [`ValidationError::Multiple`].
    pub fn into_result(mut self) -> Result<(), ValidationError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => {
                let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

/// Validator for target URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(field: &str, url: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("URL must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(' ') {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        Ok(())
    }
}

/// Validator for durations.
pub struct DurationValidator;

impl DurationValidator {
    pub fn validate_positive(field: &str, duration_str: &str) -> ValidationResult<std::time::Duration> {
        let duration = crate::utils::parse_duration_string(duration_str).map_err(|e| {
            ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("Invalid duration format '{}': {}", duration_str, e),
            }
        })?;

        if duration.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: duration_str.to_string(),
                min: "1ms".to_string(),
                max: "unlimited".to_string(),
            });
        }

        Ok(duration)
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }
}

/// Validator for HTTP methods in the replay allow-list.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] = &[
        "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE", "CONNECT",
    ];

    pub fn validate(method: &str) -> ValidationResult<()> {
        let method_upper = method.to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "methods".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        Ok(())
    }
}

/// Validator for the `yyyy/mm/dd:hh` replay cutoff.
pub struct CutoffValidator;

impl CutoffValidator {
    pub fn validate(cutoff: &str) -> ValidationResult<()> {
        let re = Regex::new(r"^[0-9]{4}/[0-9]{2}/[0-9]{2}:[0-9]{2}$").map_err(|e| {
            ValidationError::FieldError {
                field: "start_before".to_string(),
                message: e.to_string(),
            }
        })?;
        if !re.is_match(cutoff) {
            return Err(ValidationError::InvalidFormat {
                field: "start_before".to_string(),
                message: format!("Expected 'yyyy/mm/dd:hh', got: {}", cutoff),
            });
        }
        Ok(())
    }
}

/// Validator for URL filter regexes handed to the traffic generator.
pub struct RegexListValidator;

impl RegexListValidator {
    pub fn validate(field: &str, patterns: &[String]) -> ValidationResult<()> {
        for pattern in patterns {
            Regex::new(pattern).map_err(|e| ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("'{}' is not a valid regex: {}", pattern, e),
            })?;
        }
        Ok(())
    }
}
