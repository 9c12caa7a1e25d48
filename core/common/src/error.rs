//! Common error types for fieldsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single violated field constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Id of the field the error is attached to.
    pub field: String,
    /// Human-readable message.
    pub message: String,
}

/// Ordered list of field-level errors, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// Messages only, in order.
    pub fn messages(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.message.as_str()).collect()
    }

    /// Errors attached to one field.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldError> {
        self.errors.iter().filter(move |e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages().join("\n"))
    }
}

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Captured input violated one or more field constraints.
    #[error("{0}")]
    Validation(ValidationErrors),

    /// A record with the same key already exists for the form.
    #[error("Scan {key} already exists")]
    DuplicateKey { form_id: String, key: String },

    /// Transport-level failure talking to the remote service.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service rejected the bearer credential (HTTP 401).
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The remote service answered with a non-success status.
    ///
    /// `message` is the server's error text, verbatim.
    #[error("{message}")]
    Remote { status: u16, message: String },

    /// Marking a submitted batch as exported failed; no record was marked.
    #[error("Failed to mark batch as exported: {0}")]
    BatchMarking(String),

    /// The fail-closed connectivity check could not confirm reachability.
    #[error("offline")]
    Offline,

    /// The form has no unexported records.
    #[error("nothing to export for form {0}")]
    NothingToExport(String),

    /// Another export of the same form is running.
    #[error("export already in progress for form {0}")]
    ExportInProgress(String),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Transient failures that a later attempt may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_) | Error::Offline)
    }

    /// Whether this error should tear down the session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_joins_in_order() {
        let mut errors = ValidationErrors::new();
        errors.push("barcode", "Barcode is required");
        errors.push("location", "Location must differ from Barcode");

        assert_eq!(
            errors.to_string(),
            "Barcode is required\nLocation must differ from Barcode"
        );
        assert_eq!(errors.for_field("location").count(), 1);
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = Error::Remote {
            status: 400,
            message: "{\"error\":\"no active email\"}".to_string(),
        };
        assert_eq!(err.to_string(), "{\"error\":\"no active email\"}");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::Authentication("expired".into()).is_retryable());
        assert!(!Error::DuplicateKey {
            form_id: "intake".into(),
            key: "A1".into()
        }
        .is_retryable());
    }
}
