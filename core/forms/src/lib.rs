//! Form definitions and capture validation.
//!
//! A form is an ordered list of field descriptors plus two policy tags: what
//! to do when a key collides with an existing record, and whether the first
//! two fields may hold identical values. Validation is a pure transform from
//! raw input to a normalized record or an ordered list of field errors.

pub mod definition;
pub mod validator;

pub use definition::{
    DuplicatePolicy, ExportHeader, FieldDescriptor, FormDefinition, FormsConfig,
    IdenticalFieldsPolicy,
};
pub use validator::Validator;
