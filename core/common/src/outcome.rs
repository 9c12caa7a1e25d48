//! Operator-facing result shape.

use serde::{Deserialize, Serialize};

/// `{success, error?}` report handed to the operator instead of a raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    /// Collapse any result into an outcome, keeping only the error text.
    pub fn from_result<T, E: std::fmt::Display>(result: &std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_outcome_serialization_omits_missing_error() {
        let json = serde_json::to_string(&Outcome::ok()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }

    #[test]
    fn test_outcome_from_error() {
        let result: crate::Result<()> = Err(Error::Offline);
        let outcome = Outcome::from_result(&result);
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("offline"));
    }
}
