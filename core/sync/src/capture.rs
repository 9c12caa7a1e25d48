//! Capture pipeline: validate, reconcile, store, then hand off for upload.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use fieldsync_common::{Error, FormId, Result};
use fieldsync_forms::{DuplicatePolicy, FormsConfig, Validator};
use fieldsync_store::{ReconcileOutcome, Record, RecordStore};

use crate::upload::UploadAgent;

/// Turns raw operator input into stored records.
pub struct CaptureService {
    forms: Arc<FormsConfig>,
    store: Arc<RecordStore>,
    uploader: Option<UploadAgent>,
    default_policy: DuplicatePolicy,
}

impl CaptureService {
    pub fn new(
        forms: Arc<FormsConfig>,
        store: Arc<RecordStore>,
        default_policy: DuplicatePolicy,
    ) -> Self {
        Self {
            forms,
            store,
            uploader: None,
            default_policy,
        }
    }

    /// Deliver every inserted record right away, without waiting for it.
    ///
    /// Takes effect only when capture runs inside a Tokio runtime.
    pub fn with_uploader(mut self, uploader: UploadAgent) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Capture one record for `form_id`.
    ///
    /// Returns `Inserted` or `Updated`. A key collision under the `error`
    /// policy surfaces as `Error::DuplicateKey` and writes nothing. Only an
    /// insert triggers an upload, and the caller never observes its outcome.
    pub fn capture(
        &self,
        form_id: &FormId,
        raw: &HashMap<String, String>,
    ) -> Result<ReconcileOutcome> {
        let form = self.forms.require(form_id)?;
        let validator = Validator::for_form(form);
        let values = validator.validate(raw)?;
        let key = validator
            .key_of(&values)
            .ok_or_else(|| Error::Config(format!("form {} declares no fields", form_id)))?
            .to_string();

        let record = Record::new(form_id.clone(), key, values);
        let policy = form.effective_policy(self.default_policy);

        match self.store.insert_or_reconcile(&record, policy)? {
            ReconcileOutcome::Rejected { reason } => {
                debug!(form_id = %form_id, key = %record.key, "Capture rejected: {}", reason);
                Err(Error::DuplicateKey {
                    form_id: form_id.to_string(),
                    key: record.key,
                })
            }
            ReconcileOutcome::Inserted(stored) => {
                info!(record_id = %stored.id, form_id = %form_id, "Record captured");
                if let Some(uploader) = &self.uploader {
                    uploader.spawn(stored.clone());
                }
                Ok(ReconcileOutcome::Inserted(stored))
            }
            updated @ ReconcileOutcome::Updated(_) => {
                info!(form_id = %form_id, key = %record.key, "Record updated in place");
                Ok(updated)
            }
        }
    }

    /// Records of a form with their sync state, in capture order.
    pub fn records(&self, form_id: &FormId) -> Result<Vec<Record>> {
        self.forms.require(form_id)?;
        self.store.by_form(form_id)
    }

    pub fn forms(&self) -> &FormsConfig {
        &self.forms
    }
}
