//! Form definitions and the forms configuration file.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use fieldsync_common::{Error, FormId, Result};

/// What happens when a new record's key collides within the same form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the second insert; the store is not touched.
    Error,
    /// Overwrite data and capture time of the existing record.
    Update,
    /// Store the new record alongside the existing one.
    #[default]
    Allow,
}

/// Cross-field rule for the first two fields of a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdenticalFieldsPolicy {
    /// The second field must differ from the first.
    Error,
    /// Identical values are accepted.
    Allow,
}

/// One input field of a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl FieldDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            placeholder: None,
            required: false,
            min_length: None,
            max_length: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

/// Column descriptor sent with an export submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportHeader {
    pub id: String,
    pub label: String,
}

/// A capture form: ordered fields plus policy tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDefinition {
    pub id: FormId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(
        default,
        rename = "handleDuplicateKey",
        deserialize_with = "lenient_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub duplicate_policy: Option<DuplicatePolicy>,
    #[serde(
        default,
        rename = "handleIdenticalFields",
        deserialize_with = "lenient_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub identical_fields: Option<IdenticalFieldsPolicy>,
}

/// Read a policy tag, treating an unrecognized value as undeclared.
fn lenient_tag<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Some(raw) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match serde_json::from_value(raw.clone()) {
        Ok(tag) => Ok(Some(tag)),
        Err(_) => {
            warn!("Ignoring unknown policy tag {}", raw);
            Ok(None)
        }
    }
}

impl FormDefinition {
    /// Create a form with no declared policies.
    pub fn new(id: FormId, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            title: id.to_string(),
            id,
            subtitle: String::new(),
            fields,
            duplicate_policy: None,
            identical_fields: None,
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    pub fn with_identical_fields(mut self, policy: IdenticalFieldsPolicy) -> Self {
        self.identical_fields = Some(policy);
        self
    }

    /// Declared policy, or the deployment default when none is declared.
    pub fn effective_policy(&self, default: DuplicatePolicy) -> DuplicatePolicy {
        self.duplicate_policy.unwrap_or(default)
    }

    /// Whether the first two fields must differ.
    pub fn rejects_identical_fields(&self) -> bool {
        self.identical_fields == Some(IdenticalFieldsPolicy::Error)
    }

    /// The field whose value becomes the record key.
    pub fn key_field(&self) -> Option<&FieldDescriptor> {
        self.fields.first()
    }

    /// Column headers for export submissions, in field order.
    pub fn export_headers(&self) -> Vec<ExportHeader> {
        self.fields
            .iter()
            .map(|f| ExportHeader {
                id: f.id.clone(),
                label: f.label.clone(),
            })
            .collect()
    }

    /// Check the definition is usable for capture.
    ///
    /// # Errors
    /// - No fields declared
    /// - Duplicate field ids
    /// - min length greater than max length
    pub fn validate_definition(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::Config(format!("form {} has no fields", self.id)));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.id.is_empty() {
                return Err(Error::Config(format!(
                    "form {} has a field with an empty id",
                    self.id
                )));
            }
            if self.fields[..i].iter().any(|f| f.id == field.id) {
                return Err(Error::Config(format!(
                    "form {} declares field {} twice",
                    self.id, field.id
                )));
            }
            if let (Some(min), Some(max)) = (field.min_length, field.max_length) {
                if min > max {
                    return Err(Error::Config(format!(
                        "field {} of form {}: minLength {} exceeds maxLength {}",
                        field.id, self.id, min, max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The set of forms available on the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormsConfig {
    pub forms: Vec<FormDefinition>,
}

impl FormsConfig {
    pub fn new(forms: Vec<FormDefinition>) -> Self {
        Self { forms }
    }

    /// Load and check a forms file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        info!(
            "Loaded {} form(s) from {}",
            config.forms.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse and check a forms document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        for (i, form) in config.forms.iter().enumerate() {
            form.validate_definition()?;
            if config.forms[..i].iter().any(|f| f.id == form.id) {
                return Err(Error::Config(format!("form {} declared twice", form.id)));
            }
        }
        debug!("Forms document parsed: {} form(s)", config.forms.len());
        Ok(config)
    }

    /// Look up a form by id.
    pub fn get(&self, form_id: &FormId) -> Option<&FormDefinition> {
        self.forms.iter().find(|f| &f.id == form_id)
    }

    /// Look up a form by id, failing with `NotFound`.
    pub fn require(&self, form_id: &FormId) -> Result<&FormDefinition> {
        self.get(form_id)
            .ok_or_else(|| Error::NotFound(format!("form {}", form_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMS_JSON: &str = r#"{
        "forms": [
            {
                "id": "intake",
                "title": "Parcel Intake",
                "subtitle": "Scan parcel then shelf",
                "handleDuplicateKey": "error",
                "handleIdenticalFields": "error",
                "fields": [
                    { "id": "barcode", "label": "Barcode", "required": true, "minLength": 2 },
                    { "id": "shelf", "label": "Shelf", "placeholder": "A-01", "maxLength": 8 }
                ]
            },
            {
                "id": "audit",
                "fields": [ { "id": "tag", "label": "Tag" } ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_forms_document() {
        let config = FormsConfig::from_json(FORMS_JSON).unwrap();
        assert_eq!(config.forms.len(), 2);

        let intake = config.require(&FormId::new("intake").unwrap()).unwrap();
        assert_eq!(intake.duplicate_policy, Some(DuplicatePolicy::Error));
        assert!(intake.rejects_identical_fields());
        assert_eq!(intake.fields[0].min_length, Some(2));
        assert_eq!(intake.fields[1].placeholder.as_deref(), Some("A-01"));
        assert_eq!(intake.key_field().unwrap().id, "barcode");

        let audit = config.require(&FormId::new("audit").unwrap()).unwrap();
        assert_eq!(audit.duplicate_policy, None);
        assert!(!audit.rejects_identical_fields());
    }

    #[test]
    fn test_effective_policy_falls_back_to_default() {
        let config = FormsConfig::from_json(FORMS_JSON).unwrap();
        let audit = config.require(&FormId::new("audit").unwrap()).unwrap();
        assert_eq!(
            audit.effective_policy(DuplicatePolicy::Allow),
            DuplicatePolicy::Allow
        );
        assert_eq!(
            audit.effective_policy(DuplicatePolicy::Error),
            DuplicatePolicy::Error
        );
    }

    #[test]
    fn test_rejects_inconsistent_definitions() {
        let no_fields = r#"{"forms":[{"id":"x","fields":[]}]}"#;
        assert!(matches!(
            FormsConfig::from_json(no_fields),
            Err(Error::Config(_))
        ));

        let bad_lengths =
            r#"{"forms":[{"id":"x","fields":[{"id":"a","label":"A","minLength":5,"maxLength":2}]}]}"#;
        assert!(matches!(
            FormsConfig::from_json(bad_lengths),
            Err(Error::Config(_))
        ));

        let twice = r#"{"forms":[
            {"id":"x","fields":[{"id":"a","label":"A"}]},
            {"id":"x","fields":[{"id":"a","label":"A"}]}
        ]}"#;
        assert!(matches!(FormsConfig::from_json(twice), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_policy_tags_are_ignored() {
        let json = r#"{"forms":[{
            "id": "x",
            "handleDuplicateKey": "merge",
            "handleIdenticalFields": 3,
            "fields": [{"id":"a","label":"A"}]
        }]}"#;

        let config = FormsConfig::from_json(json).unwrap();
        let form = config.require(&FormId::new("x").unwrap()).unwrap();

        assert_eq!(form.duplicate_policy, None);
        assert!(!form.rejects_identical_fields());
        assert_eq!(
            form.effective_policy(DuplicatePolicy::Allow),
            DuplicatePolicy::Allow
        );
    }

    #[test]
    fn test_export_headers_follow_field_order() {
        let config = FormsConfig::from_json(FORMS_JSON).unwrap();
        let intake = config.require(&FormId::new("intake").unwrap()).unwrap();
        let headers = intake.export_headers();
        assert_eq!(headers[0].id, "barcode");
        assert_eq!(headers[1].label, "Shelf");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forms.json");
        std::fs::write(&path, FORMS_JSON).unwrap();

        let config = FormsConfig::load(&path).unwrap();
        assert_eq!(config.forms.len(), 2);
    }
}
