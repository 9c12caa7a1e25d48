//! Identifier types used throughout fieldsync.

use indexmap::IndexMap;
use rand::distr::Alphanumeric;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized mapping from field id to validated string value, in the
/// form's field order.
pub type FieldValues = IndexMap<String, String>;

/// Length of a generated batch identifier.
pub const BATCH_ID_LEN: usize = 15;

macro_rules! string_id {
    ($name:ident, $what:literal) => {
        string_id!($name, $what, |_: char| true);
    };
    ($name:ident, $what:literal, $allowed:expr) => {
        impl $name {
            /// Wrap an existing identifier.
            ///
            /// # Errors
            /// - Returns error if id is empty or contains a disallowed character
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        concat!($what, " cannot be empty").to_string(),
                    ));
                }
                if !id.chars().all($allowed) {
                    return Err(crate::Error::InvalidInput(format!(
                        concat!($what, " contains invalid characters: {}"),
                        id
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Globally unique identifier of a captured record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

string_id!(RecordId, "RecordId");

impl RecordId {
    /// Generate a fresh 32-character identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Identifies the field-descriptor set that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(String);

string_id!(FormId, "FormId");

/// Shared identifier of every record exported in one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

/// Batch ids name files on disk: no separators, no dots.
fn batch_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

string_id!(BatchId, "BatchId", batch_id_char);

impl BatchId {
    /// Generate a random alphanumeric batch identifier.
    pub fn generate() -> Self {
        let id = rand::rng()
            .sample_iter(Alphanumeric)
            .take(BATCH_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_generation() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_batch_id_shape() {
        let id = BatchId::generate();
        assert_eq!(id.as_str().len(), BATCH_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(FormId::new("").is_err());
        assert!(BatchId::new("").is_err());
        assert_eq!(FormId::new("intake").unwrap().as_str(), "intake");
    }

    #[test]
    fn test_batch_ids_cannot_escape_a_directory() {
        for bad in ["../../x", "a/b", "a\\b", "x.csv", "a b"] {
            assert!(BatchId::new(bad).is_err(), "{} accepted", bad);
        }
        assert!(BatchId::new("Ab3_x-9").is_ok());
        assert!(FormId::new("intake.v2").is_ok());
    }

    #[test]
    fn test_field_values_keep_insertion_order() {
        let mut values = FieldValues::new();
        values.insert("shelf".to_string(), "A-01".to_string());
        values.insert("barcode".to_string(), "X1".to_string());
        assert_eq!(
            serde_json::to_string(&values).unwrap(),
            r#"{"shelf":"A-01","barcode":"X1"}"#
        );
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = FormId::new("intake").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"intake\"");
    }
}
