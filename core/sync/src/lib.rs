//! Fieldsync Sync Engine
//!
//! Reconciles locally captured records with the remote service:
//! - Capture pipeline (validate, reconcile duplicates, store)
//! - Best-effort upload of freshly inserted records
//! - Outbox worker redelivering unsynced records with exponential backoff
//! - Export batching with per-form mutual exclusion and atomic marking
//! - Export browsing, resend and artifact download

pub mod browser;
pub mod capture;
pub mod config;
pub mod engine;
pub mod export;
pub mod outbox;
pub mod retry;
pub mod upload;

// Re-export main types
pub use browser::{artifact_name, DownloadOutcome, ExportBrowser, NoShare, ShareTarget};
pub use capture::CaptureService;
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use export::{ExportBatcher, ExportReport};
pub use outbox::{DrainReport, Outbox, OutboxRequest, OutboxWorker};
pub use retry::RetryConfig;
pub use upload::UploadAgent;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _report = DrainReport::default();
        assert!(!NoShare.is_available());
    }
}
