//! Export batcher: ships a form's unexported records as one batch.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use fieldsync_common::{BatchId, Error, FormId, Result};
use fieldsync_forms::FormsConfig;
use fieldsync_remote::{ConnectivityMonitor, ExportRow, ExportSubmission, RemoteService, Session};
use fieldsync_store::{Record, RecordStore};

use crate::upload::observe_auth;

/// Result of a successful export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub batch_id: BatchId,
    /// Number of records marked exported under `batch_id`.
    pub exported: usize,
    /// Unexported records of the form after the batch was marked.
    pub remaining: Vec<Record>,
    /// Status payload returned by the remote service.
    pub response: serde_json::Value,
}

/// Age after which an export lock left behind by a crashed run is taken over.
pub const EXPORT_LOCK_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Holds a form's export lock until dropped.
struct ExportSlot<'a> {
    store: &'a RecordStore,
    form_id: FormId,
    token: String,
}

impl Drop for ExportSlot<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_export_lock(&self.form_id, &self.token) {
            warn!(form_id = %self.form_id, "Failed to release export lock: {}", e);
        }
    }
}

/// Groups unexported records per form and submits them in one request.
///
/// At most one export per form runs at a time across every process sharing
/// the record database; a second concurrent call for the same form fails
/// with `Error::ExportInProgress`.
pub struct ExportBatcher {
    forms: Arc<FormsConfig>,
    store: Arc<RecordStore>,
    remote: Arc<dyn RemoteService>,
    session: Arc<dyn Session>,
    connectivity: ConnectivityMonitor,
}

impl ExportBatcher {
    pub fn new(
        forms: Arc<FormsConfig>,
        store: Arc<RecordStore>,
        remote: Arc<dyn RemoteService>,
        session: Arc<dyn Session>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            forms,
            store,
            remote,
            session,
            connectivity,
        }
    }

    fn acquire(&self, form_id: &FormId) -> Result<ExportSlot<'_>> {
        let Some(token) = self
            .store
            .try_lock_export(form_id, EXPORT_LOCK_STALE_AFTER)?
        else {
            debug!(form_id = %form_id, "Export already running");
            return Err(Error::ExportInProgress(form_id.to_string()));
        };
        Ok(ExportSlot {
            store: &self.store,
            form_id: form_id.clone(),
            token,
        })
    }

    /// Export every unexported record of `form_id` as a new batch.
    ///
    /// Nothing to export and offline are reported before any network call.
    /// A rejected submission changes nothing locally. After a successful
    /// submission all selected records are marked in one transaction; if
    /// that fails none are marked and the export can be retried.
    pub async fn export_form(&self, form_id: &FormId) -> Result<ExportReport> {
        let form = self.forms.require(form_id)?;
        let _slot = self.acquire(form_id)?;

        let records = self.store.unexported_by_form(form_id)?;
        if records.is_empty() {
            debug!(form_id = %form_id, "Nothing to export");
            return Err(Error::NothingToExport(form_id.to_string()));
        }

        if !self.connectivity.is_online_strict().await {
            info!(form_id = %form_id, "Export blocked, connectivity not confirmed");
            return Err(Error::Offline);
        }

        let batch_id = BatchId::generate();
        let submission = ExportSubmission {
            export_id: batch_id.clone(),
            form_id: form_id.clone(),
            headers: form.export_headers(),
            rows: records.iter().map(ExportRow::from).collect(),
        };

        info!(
            form_id = %form_id,
            batch_id = %batch_id,
            "Submitting export of {} records",
            records.len()
        );
        let response = match self.remote.submit_export(&submission).await {
            Ok(response) => response,
            Err(e) => {
                observe_auth(self.session.as_ref(), &e);
                error!(batch_id = %batch_id, "Export submission failed: {}", e);
                return Err(e);
            }
        };

        let ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        if let Err(e) = self.store.mark_exported(&ids, &batch_id) {
            error!(
                batch_id = %batch_id,
                "Export accepted remotely but local marking failed: {}",
                e
            );
            return Err(e);
        }

        let remaining = self.store.unexported_by_form(form_id)?;
        info!(batch_id = %batch_id, "Exported {} records", ids.len());

        Ok(ExportReport {
            batch_id,
            exported: ids.len(),
            remaining,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::FieldValues;
    use fieldsync_forms::{DuplicatePolicy, FieldDescriptor, FormDefinition};
    use fieldsync_remote::{
        FailureMode, ManualProbe, MemoryRemote, Operation, Reachability, StaticSession,
    };

    struct Fixture {
        store: Arc<RecordStore>,
        remote: MemoryRemote,
        session: Arc<StaticSession>,
        probe: Arc<ManualProbe>,
        batcher: Arc<ExportBatcher>,
    }

    fn intake_id() -> FormId {
        FormId::new("intake").unwrap()
    }

    fn fixture() -> Fixture {
        let form = FormDefinition::new(
            intake_id(),
            vec![
                FieldDescriptor::new("barcode", "Barcode").required(),
                FieldDescriptor::new("note", "Note"),
            ],
        );
        let forms = Arc::new(FormsConfig::new(vec![form]));
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let remote = MemoryRemote::new();
        let session = Arc::new(StaticSession::new("tok", None));
        let probe = Arc::new(ManualProbe::online());
        let batcher = Arc::new(ExportBatcher::new(
            forms,
            store.clone(),
            Arc::new(remote.clone()),
            session.clone(),
            ConnectivityMonitor::new(probe.clone()),
        ));
        Fixture {
            store,
            remote,
            session,
            probe,
            batcher,
        }
    }

    fn seed(store: &RecordStore, keys: &[&str]) -> Vec<Record> {
        keys.iter()
            .map(|key| {
                let mut data = FieldValues::new();
                data.insert("barcode".to_string(), key.to_string());
                data.insert("note".to_string(), String::new());
                let record = Record::new(intake_id(), *key, data);
                store
                    .insert_or_reconcile(&record, DuplicatePolicy::Allow)
                    .unwrap();
                record
            })
            .collect()
    }

    #[tokio::test]
    async fn test_export_marks_every_selected_record() {
        let f = fixture();
        let seeded = seed(&f.store, &["A1", "B2", "C3"]);

        let report = f.batcher.export_form(&intake_id()).await.unwrap();

        assert_eq!(report.exported, 3);
        assert!(report.remaining.is_empty());
        assert_eq!(report.batch_id.as_str().len(), 15);
        for record in &seeded {
            let stored = f.store.get(&record.id).unwrap().unwrap();
            assert!(stored.exported);
            assert_eq!(stored.export_batch_id.as_ref(), Some(&report.batch_id));
        }

        let submitted = f.remote.exports();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].export_id, report.batch_id);
        assert_eq!(submitted[0].rows.len(), 3);
        assert_eq!(submitted[0].headers.len(), 2);
    }

    #[tokio::test]
    async fn test_second_export_only_ships_new_records() {
        let f = fixture();
        seed(&f.store, &["A1"]);
        let first = f.batcher.export_form(&intake_id()).await.unwrap();

        seed(&f.store, &["B2"]);
        let second = f.batcher.export_form(&intake_id()).await.unwrap();

        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(second.exported, 1);
        assert_eq!(f.remote.exports()[1].rows[0].key, "B2");
    }

    #[tokio::test]
    async fn test_nothing_to_export_makes_no_request() {
        let f = fixture();

        let result = f.batcher.export_form(&intake_id()).await;

        assert!(matches!(result, Err(Error::NothingToExport(_))));
        assert_eq!(f.remote.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_offline_makes_no_request() {
        let f = fixture();
        seed(&f.store, &["A1"]);

        for state in [Reachability::Offline, Reachability::Unknown] {
            f.probe.set(state);
            let result = f.batcher.export_form(&intake_id()).await;
            assert!(matches!(result, Err(Error::Offline)));
        }
        f.probe.set_failing();
        assert!(matches!(
            f.batcher.export_form(&intake_id()).await,
            Err(Error::Offline)
        ));

        assert_eq!(f.remote.total_requests(), 0);
        assert_eq!(f.store.unexported_by_form(&intake_id()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_surfaces_server_text() {
        let f = fixture();
        seed(&f.store, &["A1", "B2"]);
        f.remote.fail(
            Operation::Export,
            FailureMode::Status(400, "Missing headers".to_string()),
        );

        let err = f.batcher.export_form(&intake_id()).await.unwrap_err();

        assert_eq!(err.to_string(), "Missing headers");
        assert_eq!(f.store.unexported_by_form(&intake_id()).unwrap().len(), 2);
        assert!(f.store.distinct_batch_ids().unwrap().is_empty());
        assert!(f.session.is_active());
    }

    #[tokio::test]
    async fn test_unauthorized_submission_invalidates_session() {
        let f = fixture();
        seed(&f.store, &["A1"]);
        f.remote.fail(Operation::Export, FailureMode::Unauthorized);

        let err = f.batcher.export_form(&intake_id()).await.unwrap_err();

        assert!(err.is_auth());
        assert!(!f.session.is_active());
        assert_eq!(f.store.unexported_by_form(&intake_id()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_slot_is_exclusive_per_form() {
        let f = fixture();

        let slot = f.batcher.acquire(&intake_id()).unwrap();
        assert!(matches!(
            f.batcher.acquire(&intake_id()),
            Err(Error::ExportInProgress(_))
        ));
        assert!(f.batcher.acquire(&FormId::new("other").unwrap()).is_ok());

        drop(slot);
        assert!(f.batcher.acquire(&intake_id()).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_exports_never_double_submit() {
        let f = fixture();
        seed(&f.store, &["A1", "B2", "C3"]);

        let a = tokio::spawn({
            let batcher = f.batcher.clone();
            async move { batcher.export_form(&intake_id()).await }
        });
        let b = tokio::spawn({
            let batcher = f.batcher.clone();
            async move { batcher.export_form(&intake_id()).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1);
        let exported: usize = f.remote.exports().iter().map(|e| e.rows.len()).sum();
        assert_eq!(exported, 3);
    }

    #[tokio::test]
    async fn test_export_lock_spans_stores_on_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldsync.db");
        let remote = MemoryRemote::new();
        let forms = Arc::new(FormsConfig::new(vec![FormDefinition::new(
            intake_id(),
            vec![FieldDescriptor::new("barcode", "Barcode").required()],
        )]));
        let batcher = || {
            ExportBatcher::new(
                forms.clone(),
                Arc::new(RecordStore::open(&path).unwrap()),
                Arc::new(remote.clone()),
                Arc::new(StaticSession::new("tok", None)),
                ConnectivityMonitor::new(Arc::new(ManualProbe::online())),
            )
        };
        let (first, second) = (batcher(), batcher());
        seed(&first.store, &["A1", "B2", "C3"]);

        let slot = first.acquire(&intake_id()).unwrap();
        assert!(matches!(
            second.export_form(&intake_id()).await,
            Err(Error::ExportInProgress(_))
        ));
        assert_eq!(remote.total_requests(), 0);
        drop(slot);

        let (id_a, id_b) = (intake_id(), intake_id());
        let (a, b) = tokio::join!(first.export_form(&id_a), second.export_form(&id_b));
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        let exported: usize = remote.exports().iter().map(|e| e.rows.len()).sum();
        assert_eq!(exported, 3);
        assert_eq!(second.store.distinct_batch_ids().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_form() {
        let f = fixture();
        let result = f.batcher.export_form(&FormId::new("nope").unwrap()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
