//! The captured record and reconciliation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::{BatchId, FieldValues, FormId, RecordId};

/// One captured, validated unit of field data tied to a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned at creation, immutable.
    pub id: RecordId,
    pub form_id: FormId,
    /// Value of the first validated field; dedup key within the form.
    pub key: String,
    pub data: FieldValues,
    /// Set at creation; only the update-on-duplicate path rewrites it.
    pub captured_at: DateTime<Utc>,
    /// Delivered to the remote ingest endpoint. Never reverts.
    pub synced: bool,
    /// Included in a successfully submitted batch.
    pub exported: bool,
    /// Present exactly when `exported` is true.
    pub export_batch_id: Option<BatchId>,
}

impl Record {
    /// Create a fresh, unsynced, unexported record.
    pub fn new(form_id: FormId, key: impl Into<String>, data: FieldValues) -> Self {
        Self {
            id: RecordId::generate(),
            form_id,
            key: key.into(),
            data,
            captured_at: now_millis(),
            synced: false,
            exported: false,
            export_batch_id: None,
        }
    }

    /// Serialized form of `data` as stored in the table.
    pub fn data_json(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Current time truncated to the millisecond precision the table keeps.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Result of [`RecordStore::insert_or_reconcile`](crate::RecordStore::insert_or_reconcile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stored as a new record.
    Inserted(Record),
    /// An existing record with the same key was overwritten in place.
    Updated(Record),
    /// Key collision under the `error` policy; nothing was written.
    Rejected { reason: String },
}

impl ReconcileOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ReconcileOutcome::Inserted(_) => "inserted",
            ReconcileOutcome::Updated(_) => "updated",
            ReconcileOutcome::Rejected { .. } => "rejected",
        }
    }

    /// The stored record, unless the insert was rejected.
    pub fn record(&self) -> Option<&Record> {
        match self {
            ReconcileOutcome::Inserted(r) | ReconcileOutcome::Updated(r) => Some(r),
            ReconcileOutcome::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let mut data = FieldValues::new();
        data.insert("barcode".to_string(), "A1".to_string());
        let record = Record::new(FormId::new("intake").unwrap(), "A1", data);

        assert!(!record.synced);
        assert!(!record.exported);
        assert!(record.export_batch_id.is_none());
        assert_eq!(record.data_json(), r#"{"barcode":"A1"}"#);
        assert_eq!(record.captured_at.timestamp_subsec_micros() % 1000, 0);
    }

    #[test]
    fn test_outcome_status() {
        let rejected = ReconcileOutcome::Rejected {
            reason: "duplicate key".to_string(),
        };
        assert_eq!(rejected.status(), "rejected");
        assert!(rejected.record().is_none());
    }
}
