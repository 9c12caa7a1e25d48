//! Export browser: past batches, their records, resend and download.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use fieldsync_common::{BatchId, Result};
use fieldsync_remote::{RemoteService, Session};
use fieldsync_store::{Record, RecordStore};

use crate::upload::observe_auth;

/// Hands a downloaded artifact to something outside the process.
#[async_trait]
pub trait ShareTarget: Send + Sync {
    /// Whether sharing is possible on this device.
    fn is_available(&self) -> bool;

    async fn share(&self, path: &Path) -> Result<()>;
}

/// Share target for environments without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShare;

#[async_trait]
impl ShareTarget for NoShare {
    fn is_available(&self) -> bool {
        false
    }

    async fn share(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Where a downloaded artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// False when no share target was available; `path` is all there is.
    pub shared: bool,
}

/// File name of a batch's consolidated artifact.
pub fn artifact_name(batch_id: &BatchId) -> String {
    format!("{}_full.csv", batch_id)
}

/// Read-mostly view over past export batches.
///
/// Nothing here mutates the record store.
pub struct ExportBrowser {
    store: Arc<RecordStore>,
    remote: Arc<dyn RemoteService>,
    session: Arc<dyn Session>,
    share: Arc<dyn ShareTarget>,
    export_dir: PathBuf,
}

impl ExportBrowser {
    pub fn new(
        store: Arc<RecordStore>,
        remote: Arc<dyn RemoteService>,
        session: Arc<dyn Session>,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            remote,
            session,
            share: Arc::new(NoShare),
            export_dir: export_dir.into(),
        }
    }

    pub fn with_share_target(mut self, share: Arc<dyn ShareTarget>) -> Self {
        self.share = share;
        self
    }

    /// Batch identifiers created so far, oldest first.
    pub fn list_batches(&self) -> Result<Vec<BatchId>> {
        self.store.distinct_batch_ids()
    }

    /// Records exported under `batch_id`.
    ///
    /// A record whose stored payload is unreadable comes back with empty data.
    pub fn open_batch(&self, batch_id: &BatchId) -> Result<Vec<Record>> {
        self.store.by_batch_id(batch_id)
    }

    /// Ask the remote service to re-deliver the batch notification.
    pub async fn resend(&self, batch_id: &BatchId) -> Result<serde_json::Value> {
        let response = self
            .remote
            .resend_export(batch_id)
            .await
            .inspect_err(|e| observe_auth(self.session.as_ref(), e))?;
        info!(batch_id = %batch_id, "Export resent");
        Ok(response)
    }

    /// Exports the remote service knows about.
    pub async fn remote_batches(&self) -> Result<serde_json::Value> {
        self.remote
            .list_exports()
            .await
            .inspect_err(|e| observe_auth(self.session.as_ref(), e))
    }

    /// Fetch the batch artifact, write it to the export directory and offer
    /// it for sharing.
    pub async fn download(&self, batch_id: &BatchId) -> Result<DownloadOutcome> {
        let filename = artifact_name(batch_id);
        let bytes = self
            .remote
            .download_export(batch_id, &filename)
            .await
            .inspect_err(|e| observe_auth(self.session.as_ref(), e))?;

        tokio::fs::create_dir_all(&self.export_dir).await?;
        let path = self.export_dir.join(&filename);
        tokio::fs::write(&path, &bytes).await?;
        debug!(batch_id = %batch_id, "Wrote {} bytes to {}", bytes.len(), path.display());

        if !self.share.is_available() {
            info!("Sharing not available, artifact saved to {}", path.display());
            return Ok(DownloadOutcome {
                path,
                shared: false,
            });
        }

        self.share.share(&path).await?;
        Ok(DownloadOutcome { path, shared: true })
    }
}
