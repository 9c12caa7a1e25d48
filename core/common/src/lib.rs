//! Common utilities and types shared across the fieldsync crates.
//!
//! This module provides the error taxonomy, identifier newtypes and the
//! operator-facing outcome shape used by every other crate.

pub mod error;
pub mod outcome;
pub mod types;

pub use error::{Error, Result, ValidationErrors};
pub use outcome::Outcome;
pub use types::{BatchId, FieldValues, FormId, RecordId};
