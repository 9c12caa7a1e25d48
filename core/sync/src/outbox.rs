//! Outbox worker: periodic redelivery of unsynced records with backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, Result};
use fieldsync_remote::ConnectivityMonitor;
use fieldsync_store::Record;

use crate::config::SyncConfig;
use crate::upload::UploadAgent;

/// Requests accepted by a running worker.
#[derive(Debug)]
pub enum OutboxRequest {
    /// Run one delivery round now.
    Drain,
    /// Stop the worker.
    Shutdown,
}

/// Result of one delivery round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// The round stopped because the credential was rejected.
    pub auth_rejected: bool,
    /// The round was skipped because the device is offline.
    pub offline: bool,
}

impl DrainReport {
    /// A round that tried something and got nothing through.
    pub fn is_failing(&self) -> bool {
        self.offline || self.auth_rejected || (self.failed > 0 && self.synced == 0)
    }
}

type Reply = oneshot::Sender<Result<DrainReport>>;

/// Client side of a running outbox worker.
#[derive(Clone)]
pub struct Outbox {
    request_tx: mpsc::Sender<(OutboxRequest, Reply)>,
}

impl Outbox {
    /// Create the request channel and the worker that serves it.
    pub fn new(
        uploader: UploadAgent,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> (Self, OutboxWorker) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let worker = OutboxWorker {
            uploader,
            connectivity,
            config,
            request_rx: Some(request_rx),
        };
        (Self { request_tx }, worker)
    }

    /// Ask the worker to run a round now and wait for its report.
    pub async fn drain(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((OutboxRequest::Drain, response_tx))
            .await
            .map_err(|_| Error::Config("Outbox worker not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Config("Failed to receive outbox result".to_string()))?
    }

    /// Stop the worker.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((OutboxRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background task delivering `synced=false` records in insertion order.
pub struct OutboxWorker {
    uploader: UploadAgent,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    request_rx: Option<mpsc::Receiver<(OutboxRequest, Reply)>>,
}

impl OutboxWorker {
    /// Run one delivery round.
    ///
    /// Skipped when the fail-open connectivity check says offline. Stops at
    /// the first rejected credential or transport failure. A record the
    /// server rejects is deferred with per-record backoff and the round
    /// moves on, so rejected records never block newer ones.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if !self.connectivity.is_online().await {
            debug!("Outbox round skipped, offline");
            report.offline = true;
            return Ok(report);
        }

        let pending = self
            .uploader
            .store()
            .due_for_delivery(self.config.outbox_batch_limit)?;

        for record in &pending {
            report.attempted += 1;
            match self.uploader.upload(record).await {
                Ok(()) => report.synced += 1,
                Err(e) if e.is_auth() => {
                    warn!(record_id = %record.id, "Outbox stopped, credential rejected");
                    report.auth_rejected = true;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    report.failed += 1;
                    warn!(record_id = %record.id, "Outbox delivery failed: {}", e);
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    self.defer(record, &e);
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "Outbox round: {} attempted, {} synced, {} failed",
                report.attempted, report.synced, report.failed
            );
        }
        Ok(report)
    }

    fn defer(&self, record: &Record, cause: &Error) {
        let retry = &self.config.retry;
        let deferred = self
            .uploader
            .store()
            .defer_delivery(&record.id, |attempts| {
                retry.delay_for_attempt(attempts.saturating_sub(1))
            });
        match deferred {
            Ok(attempts) => {
                warn!(record_id = %record.id, attempts, "Delivery rejected, deferred: {}", cause)
            }
            Err(e) => error!(record_id = %record.id, "Failed to defer delivery: {}", e),
        }
    }

    /// Delay before the next periodic round.
    fn next_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            self.config.outbox_interval()
        } else {
            self.config.retry.delay_for_attempt(failures - 1)
        }
    }

    /// Run until shutdown is requested or every [`Outbox`] handle is dropped.
    ///
    /// Periodic rounds are paused while no credential is available; explicit
    /// drain requests always run.
    pub async fn run(mut self) {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Outbox worker can only be run once");
            return;
        };
        let mut failures: u32 = 0;

        info!("Outbox worker started");

        loop {
            let delay = self.next_delay(failures);

            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some((OutboxRequest::Drain, response_tx)) => {
                            let result = self.drain().await;
                            failures = Self::track(failures, &result);
                            let _ = response_tx.send(result);
                        }
                        Some((OutboxRequest::Shutdown, _)) | None => {
                            info!("Outbox worker shutting down");
                            break;
                        }
                    }
                }

                _ = sleep(delay) => {
                    if !self.uploader.has_credential() {
                        debug!("Outbox round skipped, no credential");
                        continue;
                    }
                    let result = self.drain().await;
                    if let Err(e) = &result {
                        error!("Outbox round failed: {}", e);
                    }
                    failures = Self::track(failures, &result);
                    if failures > 0 {
                        debug!("Outbox backing off after {} failing rounds", failures);
                    }
                }
            }
        }
    }

    fn track(failures: u32, result: &Result<DrainReport>) -> u32 {
        match result {
            Ok(report) if !report.is_failing() => 0,
            _ => failures.saturating_add(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::{FieldValues, FormId};
    use fieldsync_forms::DuplicatePolicy;
    use fieldsync_remote::{FailureMode, ManualProbe, MemoryRemote, Operation, StaticSession};
    use fieldsync_store::RecordStore;

    struct Fixture {
        store: Arc<RecordStore>,
        remote: MemoryRemote,
        session: Arc<StaticSession>,
        probe: Arc<ManualProbe>,
        outbox: Outbox,
        worker: OutboxWorker,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let remote = MemoryRemote::new();
        let session = Arc::new(StaticSession::new("tok", None));
        let probe = Arc::new(ManualProbe::online());
        let uploader = UploadAgent::new(store.clone(), Arc::new(remote.clone()), session.clone());
        let (outbox, worker) =
            Outbox::new(uploader, ConnectivityMonitor::new(probe.clone()), config);
        Fixture {
            store,
            remote,
            session,
            probe,
            outbox,
            worker,
        }
    }

    fn seed(store: &RecordStore, keys: &[&str]) -> Vec<Record> {
        keys.iter()
            .map(|key| {
                let mut data = FieldValues::new();
                data.insert("barcode".to_string(), key.to_string());
                let record = Record::new(FormId::new("intake").unwrap(), *key, data);
                store
                    .insert_or_reconcile(&record, DuplicatePolicy::Allow)
                    .unwrap();
                record
            })
            .collect()
    }

    #[tokio::test]
    async fn test_drain_delivers_pending_records() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1", "B2", "C3"]);

        let report = f.worker.drain().await.unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 3);
        assert!(f.store.unsynced(10).unwrap().is_empty());
        assert_eq!(f.remote.ingested_count(), 3);
    }

    #[tokio::test]
    async fn test_drain_respects_batch_limit() {
        let config = SyncConfig {
            outbox_batch_limit: 2,
            ..SyncConfig::default()
        };
        let f = fixture(config);
        seed(&f.store, &["A1", "B2", "C3"]);

        let report = f.worker.drain().await.unwrap();

        assert_eq!(report.synced, 2);
        assert_eq!(f.store.unsynced(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_skips_when_offline() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1"]);
        f.probe.set(fieldsync_remote::Reachability::Offline);

        let report = f.worker.drain().await.unwrap();

        assert!(report.offline);
        assert_eq!(f.remote.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_drain_fails_open_on_uncertain_connectivity() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1"]);
        f.probe.set_failing();

        let report = f.worker.drain().await.unwrap();

        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_drain_stops_on_unauthorized() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1", "B2"]);
        f.remote.fail(Operation::Ingest, FailureMode::Unauthorized);

        let report = f.worker.drain().await.unwrap();

        assert!(report.auth_rejected);
        assert_eq!(report.attempted, 1);
        assert!(!f.session.is_active());
        assert_eq!(f.store.unsynced(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_stops_on_network_failure() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1", "B2"]);
        f.remote.fail(Operation::Ingest, FailureMode::Network);

        let report = f.worker.drain().await.unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        assert!(report.is_failing());
    }

    #[tokio::test]
    async fn test_drain_continues_past_rejected_record() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1", "B2"]);
        f.remote.fail(
            Operation::Ingest,
            FailureMode::Status(422, "bad record".to_string()),
        );

        let report = f.worker.drain().await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_rejected_records_do_not_block_newer_ones() {
        let config = SyncConfig {
            outbox_batch_limit: 2,
            ..SyncConfig::default()
        };
        let f = fixture(config);
        seed(&f.store, &["BAD1", "BAD2", "GOOD"]);
        f.remote.fail(
            Operation::Ingest,
            FailureMode::Status(422, "bad record".to_string()),
        );

        let first = f.worker.drain().await.unwrap();
        assert_eq!(first.failed, 2);
        f.remote.clear_failure(Operation::Ingest);

        let second = f.worker.drain().await.unwrap();
        assert_eq!(second.attempted, 1);
        assert_eq!(second.synced, 1);

        let pending: Vec<_> = f
            .store
            .unsynced(10)
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(pending, vec!["BAD1", "BAD2"]);
        assert!(f.store.due_for_delivery(10).unwrap().is_empty());
    }

    #[test]
    fn test_backoff_grows_with_failures() {
        let config = SyncConfig {
            outbox_interval_secs: 60,
            retry: crate::RetryConfig::new()
                .with_initial_delay(Duration::from_secs(1))
                .with_jitter(false),
            ..SyncConfig::default()
        };
        let f = fixture(config);

        assert_eq!(f.worker.next_delay(0), Duration::from_secs(60));
        assert_eq!(f.worker.next_delay(1), Duration::from_secs(1));
        assert_eq!(f.worker.next_delay(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_worker_serves_drain_requests() {
        let f = fixture(SyncConfig::default());
        seed(&f.store, &["A1", "B2"]);

        let task = tokio::spawn(f.worker.run());

        let report = f.outbox.drain().await.unwrap();
        assert_eq!(report.synced, 2);

        f.outbox.shutdown().await;
        task.await.unwrap();

        assert!(f.outbox.drain().await.is_err());
    }
}
