//! In-memory remote service for testing.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fieldsync_common::{BatchId, Error, RecordId, Result};

use crate::service::{ExportSubmission, IngestPayload, RemoteService};

/// Remote operation, for failure injection and request counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ingest,
    Export,
    Resend,
    Download,
    List,
}

/// Injected failure for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMode {
    /// Transport failure.
    Network,
    /// HTTP 401.
    Unauthorized,
    /// Any other non-success status with a body.
    Status(u16, String),
}

impl FailureMode {
    fn to_error(&self) -> Error {
        match self {
            FailureMode::Network => Error::Network("connection reset".to_string()),
            FailureMode::Unauthorized => {
                Error::Authentication("Invalid or expired token".to_string())
            }
            FailureMode::Status(status, message) => Error::Remote {
                status: *status,
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    ingested: HashMap<RecordId, IngestPayload>,
    exports: Vec<ExportSubmission>,
    artifacts: HashMap<BatchId, Bytes>,
    resent: Vec<BatchId>,
    failures: HashMap<Operation, FailureMode>,
    requests: HashMap<Operation, usize>,
}

/// In-memory remote service.
///
/// Ingest is idempotent on the record id. Every accepted export gets a CSV
/// artifact that `download_export` serves back.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent call of `operation` until cleared.
    pub fn fail(&self, operation: Operation, mode: FailureMode) {
        self.write().failures.insert(operation, mode);
    }

    pub fn clear_failure(&self, operation: Operation) {
        self.write().failures.remove(&operation);
    }

    /// Number of calls made for `operation`, including failed ones.
    pub fn requests(&self, operation: Operation) -> usize {
        self.read().requests.get(&operation).copied().unwrap_or(0)
    }

    /// Total number of calls across all operations.
    pub fn total_requests(&self) -> usize {
        self.read().requests.values().sum()
    }

    pub fn ingested(&self, id: &RecordId) -> Option<IngestPayload> {
        self.read().ingested.get(id).cloned()
    }

    pub fn ingested_count(&self) -> usize {
        self.read().ingested.len()
    }

    pub fn exports(&self) -> Vec<ExportSubmission> {
        self.read().exports.clone()
    }

    pub fn resent(&self) -> Vec<BatchId> {
        self.read().resent.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and apply any injected failure.
    fn enter(&self, operation: Operation) -> Result<()> {
        let mut inner = self.write();
        *inner.requests.entry(operation).or_insert(0) += 1;
        match inner.failures.get(&operation) {
            Some(mode) => Err(mode.to_error()),
            None => Ok(()),
        }
    }
}

/// Quote a CSV cell, doubling embedded quotes.
fn csv_cell(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn render_csv(submission: &ExportSubmission) -> Bytes {
    let mut out = String::new();
    let header: Vec<String> = submission
        .headers
        .iter()
        .map(|h| csv_cell(&h.label))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in &submission.rows {
        let cells: Vec<String> = submission
            .headers
            .iter()
            .map(|h| csv_cell(row.data.get(&h.id).map(String::as_str).unwrap_or("")))
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    Bytes::from(out)
}

#[async_trait]
impl RemoteService for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ingest(&self, payload: &IngestPayload) -> Result<()> {
        self.enter(Operation::Ingest)?;
        self.write()
            .ingested
            .insert(payload.id.clone(), payload.clone());
        Ok(())
    }

    async fn submit_export(&self, submission: &ExportSubmission) -> Result<serde_json::Value> {
        self.enter(Operation::Export)?;
        let mut inner = self.write();
        inner
            .artifacts
            .insert(submission.export_id.clone(), render_csv(submission));
        inner.exports.push(submission.clone());
        Ok(serde_json::json!({
            "exportId": submission.export_id,
            "rows": submission.rows.len(),
        }))
    }

    async fn resend_export(&self, batch_id: &BatchId) -> Result<serde_json::Value> {
        self.enter(Operation::Resend)?;
        let mut inner = self.write();
        if !inner.artifacts.contains_key(batch_id) {
            return Err(Error::Remote {
                status: 404,
                message: format!("export {} not found", batch_id),
            });
        }
        inner.resent.push(batch_id.clone());
        Ok(serde_json::json!({ "message": "Export email re-sent" }))
    }

    async fn download_export(&self, batch_id: &BatchId, _filename: &str) -> Result<Bytes> {
        self.enter(Operation::Download)?;
        self.read()
            .artifacts
            .get(batch_id)
            .cloned()
            .ok_or_else(|| Error::Remote {
                status: 404,
                message: format!("export {} not found", batch_id),
            })
    }

    async fn list_exports(&self) -> Result<serde_json::Value> {
        self.enter(Operation::List)?;
        let exports: Vec<_> = self
            .read()
            .exports
            .iter()
            .map(|e| {
                serde_json::json!({
                    "exportId": e.export_id,
                    "formId": e.form_id,
                    "rows": e.rows.len(),
                })
            })
            .collect();
        Ok(serde_json::Value::Array(exports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ExportRow;
    use fieldsync_common::{FieldValues, FormId};
    use fieldsync_forms::ExportHeader;
    use fieldsync_store::Record;

    fn record(key: &str, note: &str) -> Record {
        let mut data = FieldValues::new();
        data.insert("barcode".to_string(), key.to_string());
        data.insert("note".to_string(), note.to_string());
        Record::new(FormId::new("intake").unwrap(), key, data)
    }

    fn submission(records: &[Record]) -> ExportSubmission {
        ExportSubmission {
            export_id: BatchId::generate(),
            form_id: FormId::new("intake").unwrap(),
            headers: vec![
                ExportHeader {
                    id: "barcode".to_string(),
                    label: "Barcode".to_string(),
                },
                ExportHeader {
                    id: "note".to_string(),
                    label: "Note".to_string(),
                },
            ],
            rows: records.iter().map(ExportRow::from).collect(),
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_on_id() {
        let remote = MemoryRemote::new();
        let payload = IngestPayload::from_record(&record("A1", ""), None);

        remote.ingest(&payload).await.unwrap();
        remote.ingest(&payload).await.unwrap();

        assert_eq!(remote.ingested_count(), 1);
        assert_eq!(remote.requests(Operation::Ingest), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = MemoryRemote::new();
        let payload = IngestPayload::from_record(&record("A1", ""), None);

        remote.fail(Operation::Ingest, FailureMode::Unauthorized);
        assert!(matches!(
            remote.ingest(&payload).await,
            Err(Error::Authentication(_))
        ));

        remote.fail(
            Operation::Ingest,
            FailureMode::Status(500, "boom".to_string()),
        );
        let err = remote.ingest(&payload).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");

        remote.clear_failure(Operation::Ingest);
        remote.ingest(&payload).await.unwrap();
        assert_eq!(remote.ingested_count(), 1);
    }

    #[tokio::test]
    async fn test_export_artifact_roundtrip() {
        let remote = MemoryRemote::new();
        let sub = submission(&[record("A1", "say \"hi\""), record("B2", "")]);

        remote.submit_export(&sub).await.unwrap();
        let artifact = remote
            .download_export(&sub.export_id, "x_full.csv")
            .await
            .unwrap();
        let csv = String::from_utf8(artifact.to_vec()).unwrap();

        assert_eq!(
            csv,
            "\"Barcode\",\"Note\"\n\"A1\",\"say \"\"hi\"\"\"\n\"B2\",\"\"\n"
        );
    }

    #[tokio::test]
    async fn test_resend_unknown_batch() {
        let remote = MemoryRemote::new();
        let err = remote
            .resend_export(&BatchId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_list_exports() {
        let remote = MemoryRemote::new();
        let sub = submission(&[record("A1", "")]);
        remote.submit_export(&sub).await.unwrap();

        let list = remote.list_exports().await.unwrap();
        assert_eq!(list[0]["exportId"], sub.export_id.as_str());
        assert_eq!(list[0]["rows"], 1);
    }
}
