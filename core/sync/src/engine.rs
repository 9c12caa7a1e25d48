//! Sync engine wiring the record store to the remote service.

use std::sync::Arc;

use fieldsync_forms::FormsConfig;
use fieldsync_remote::{ConnectivityMonitor, RemoteService, Session};
use fieldsync_store::RecordStore;

use crate::browser::{ExportBrowser, ShareTarget};
use crate::capture::CaptureService;
use crate::config::SyncConfig;
use crate::export::ExportBatcher;
use crate::outbox::{Outbox, OutboxWorker};
use crate::upload::UploadAgent;

/// Owns the shared collaborators and hands out the components built on them.
pub struct SyncEngine {
    store: Arc<RecordStore>,
    config: SyncConfig,
    connectivity: ConnectivityMonitor,
    uploader: UploadAgent,
    capture: CaptureService,
    exporter: ExportBatcher,
    browser: ExportBrowser,
}

impl SyncEngine {
    pub fn new(
        forms: Arc<FormsConfig>,
        store: Arc<RecordStore>,
        remote: Arc<dyn RemoteService>,
        session: Arc<dyn Session>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let uploader = UploadAgent::new(store.clone(), remote.clone(), session.clone());

        let mut capture =
            CaptureService::new(forms.clone(), store.clone(), config.default_duplicate_policy);
        if config.upload_on_capture {
            capture = capture.with_uploader(uploader.clone());
        }

        let exporter = ExportBatcher::new(
            forms,
            store.clone(),
            remote.clone(),
            session.clone(),
            connectivity.clone(),
        );
        let browser = ExportBrowser::new(store.clone(), remote, session, &config.export_dir);

        Self {
            store,
            config,
            connectivity,
            uploader,
            capture,
            exporter,
            browser,
        }
    }

    /// Replace the share target used for downloaded artifacts.
    pub fn with_share_target(mut self, share: Arc<dyn ShareTarget>) -> Self {
        self.browser = self.browser.with_share_target(share);
        self
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn uploader(&self) -> &UploadAgent {
        &self.uploader
    }

    pub fn capture(&self) -> &CaptureService {
        &self.capture
    }

    pub fn exporter(&self) -> &ExportBatcher {
        &self.exporter
    }

    pub fn browser(&self) -> &ExportBrowser {
        &self.browser
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Build the outbox channel and its worker. The worker must be spawned.
    pub fn outbox(&self) -> (Outbox, OutboxWorker) {
        Outbox::new(
            self.uploader.clone(),
            self.connectivity.clone(),
            self.config.clone(),
        )
    }
}
