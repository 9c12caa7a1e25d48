//! Remote service trait and wire payloads.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::{BatchId, FieldValues, FormId, RecordId, Result};
use fieldsync_forms::ExportHeader;
use fieldsync_store::Record;

/// Body of an ingest request: one freshly captured record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestPayload {
    pub id: RecordId,
    pub user_id: Option<String>,
    pub form_id: FormId,
    pub scanned_at: DateTime<Utc>,
    /// JSON-serialized field map.
    pub data: String,
    pub key: String,
}

impl IngestPayload {
    pub fn from_record(record: &Record, user_id: Option<String>) -> Self {
        Self {
            id: record.id.clone(),
            user_id,
            form_id: record.form_id.clone(),
            scanned_at: record.captured_at,
            data: record.data_json(),
            key: record.key.clone(),
        }
    }
}

/// One row of an export submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    pub id: RecordId,
    pub form_id: FormId,
    pub data: FieldValues,
    pub key: String,
    /// Serialized as ISO-8601.
    pub scanned_at: DateTime<Utc>,
}

impl From<&Record> for ExportRow {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            form_id: record.form_id.clone(),
            data: record.data.clone(),
            key: record.key.clone(),
            scanned_at: record.captured_at,
        }
    }
}

/// A whole export batch, submitted in one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSubmission {
    pub export_id: BatchId,
    pub form_id: FormId,
    pub headers: Vec<ExportHeader>,
    pub rows: Vec<ExportRow>,
}

/// Remote service trait.
///
/// Implementations attach the current bearer credential themselves. A 401
/// surfaces as `Error::Authentication`, any other non-success status as
/// `Error::Remote` carrying the server's text, and transport failures as
/// `Error::Network`.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Get the service name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Deliver one record to the ingest endpoint.
    ///
    /// The service must be idempotent on the record id; callers deliver
    /// at least once.
    async fn ingest(&self, payload: &IngestPayload) -> Result<()>;

    /// Submit an export batch. Returns the server's status payload.
    async fn submit_export(&self, submission: &ExportSubmission) -> Result<serde_json::Value>;

    /// Ask the server to re-deliver a batch notification.
    async fn resend_export(&self, batch_id: &BatchId) -> Result<serde_json::Value>;

    /// Fetch the consolidated artifact of a batch.
    async fn download_export(&self, batch_id: &BatchId, filename: &str) -> Result<Bytes>;

    /// The exports the server knows about for this operator.
    async fn list_exports(&self) -> Result<serde_json::Value>;
}
