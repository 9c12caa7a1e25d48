//! Schema-driven validation of captured input.

use std::collections::HashMap;

use fieldsync_common::{FieldValues, ValidationErrors};

use crate::definition::{FieldDescriptor, FormDefinition};

/// Normalize-or-errors function built from an ordered descriptor list.
///
/// Every value is trimmed, then checked against the descriptor's required
/// flag and length bounds. All violated constraints are reported, in field
/// order. Fields not present in the raw input are treated as empty.
#[derive(Debug, Clone)]
pub struct Validator {
    fields: Vec<FieldDescriptor>,
    reject_identical: bool,
}

impl Validator {
    pub fn new(fields: Vec<FieldDescriptor>, reject_identical: bool) -> Self {
        Self {
            fields,
            reject_identical,
        }
    }

    pub fn for_form(form: &FormDefinition) -> Self {
        Self::new(form.fields.clone(), form.rejects_identical_fields())
    }

    /// Validate raw input.
    ///
    /// Returns the normalized values (only declared fields are kept) or the
    /// list of violations.
    pub fn validate(
        &self,
        raw: &HashMap<String, String>,
    ) -> Result<FieldValues, ValidationErrors> {
        let mut values = FieldValues::new();
        let mut errors = ValidationErrors::new();

        for field in &self.fields {
            let value = raw.get(&field.id).map(|v| v.trim()).unwrap_or_default();
            check_field(field, value, &mut errors);
            values.insert(field.id.clone(), value.to_string());
        }

        if self.reject_identical && self.fields.len() >= 2 {
            let (first, second) = (&self.fields[0], &self.fields[1]);
            if values.get(&first.id) == values.get(&second.id) {
                errors.push(
                    second.id.clone(),
                    format!("{} must differ from {}", second.label, first.label),
                );
            }
        }

        if errors.is_empty() {
            Ok(values)
        } else {
            Err(errors)
        }
    }

    /// Key of a validated record: the value of its first field.
    pub fn key_of<'a>(&self, values: &'a FieldValues) -> Option<&'a str> {
        self.fields
            .first()
            .and_then(|f| values.get(&f.id))
            .map(String::as_str)
    }
}

fn check_field(field: &FieldDescriptor, value: &str, errors: &mut ValidationErrors) {
    let len = value.chars().count();

    if field.required && value.is_empty() {
        errors.push(field.id.clone(), format!("{} is required", field.label));
    }
    if let Some(min) = field.min_length {
        if len < min {
            errors.push(
                field.id.clone(),
                format!("{} must be at least {} characters", field.label, min),
            );
        }
    }
    if let Some(max) = field.max_length {
        if len > max {
            errors.push(
                field.id.clone(),
                format!("{} must be at most {} characters", field.label, max),
            );
        }
    }
}
