//! Upload agent: best-effort delivery of one record to the ingest endpoint.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fieldsync_common::{Error, Result};
use fieldsync_remote::{IngestPayload, RemoteService, Session};
use fieldsync_store::{Record, RecordStore};

/// Tear the session down if the remote service rejected the credential.
pub(crate) fn observe_auth(session: &dyn Session, err: &Error) {
    if err.is_auth() {
        session.invalidate();
    }
}

/// Delivers records to the remote ingest endpoint and marks them synced.
#[derive(Clone)]
pub struct UploadAgent {
    store: Arc<RecordStore>,
    remote: Arc<dyn RemoteService>,
    session: Arc<dyn Session>,
}

impl UploadAgent {
    pub fn new(
        store: Arc<RecordStore>,
        remote: Arc<dyn RemoteService>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self {
            store,
            remote,
            session,
        }
    }

    /// Whether a bearer credential is currently available.
    pub fn has_credential(&self) -> bool {
        self.session.bearer_token().is_some()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Deliver one record.
    ///
    /// On success the record is marked synced. A 401 invalidates the session
    /// and is returned as `Error::Authentication`; the record stays unsynced.
    pub async fn upload(&self, record: &Record) -> Result<()> {
        let payload = IngestPayload::from_record(record, self.session.user_id());

        if let Err(e) = self.remote.ingest(&payload).await {
            observe_auth(self.session.as_ref(), &e);
            return Err(e);
        }

        if self.store.mark_synced(&record.id)? {
            debug!(record_id = %record.id, "Record synced");
        }
        Ok(())
    }

    /// Fire-and-forget delivery. The outcome is only logged.
    ///
    /// Outside a Tokio runtime nothing is spawned and `None` is returned;
    /// the record stays unsynced for the outbox.
    pub fn spawn(&self, record: Record) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            debug!(record_id = %record.id, "No runtime, upload left for the outbox");
            return None;
        };
        let agent = self.clone();
        Some(runtime.spawn(async move {
            match agent.upload(&record).await {
                Ok(()) => {}
                Err(e) if e.is_auth() => {
                    info!(record_id = %record.id, "Upload stopped, credential rejected");
                }
                Err(e) => {
                    warn!(record_id = %record.id, "Upload failed, left for the outbox: {}", e);
                }
            }
        }))
    }
}
