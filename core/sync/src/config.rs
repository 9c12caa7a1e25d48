//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use fieldsync_forms::DuplicatePolicy;

use crate::retry::RetryConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic outbox rounds.
    pub outbox_interval_secs: u64,
    /// Maximum number of records delivered per outbox round.
    pub outbox_batch_limit: usize,
    /// Backoff applied after a failing round.
    pub retry: RetryConfig,
    /// Policy for forms that declare none.
    pub default_duplicate_policy: DuplicatePolicy,
    /// Where downloaded export artifacts are written.
    pub export_dir: PathBuf,
    /// Attempt delivery right after a record is inserted.
    pub upload_on_capture: bool,
}

impl SyncConfig {
    pub fn outbox_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_interval_secs.max(1))
    }

    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    pub fn with_default_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.default_duplicate_policy = policy;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbox_interval_secs: 60,
            outbox_batch_limit: 50,
            retry: RetryConfig::default(),
            default_duplicate_policy: DuplicatePolicy::Allow,
            export_dir: PathBuf::from("exports"),
            upload_on_capture: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.outbox_interval(), Duration::from_secs(60));
        assert_eq!(config.default_duplicate_policy, DuplicatePolicy::Allow);
        assert!(config.upload_on_capture);
    }

    #[test]
    fn test_partial_json() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"outbox_interval_secs": 0, "default_duplicate_policy": "error"}"#,
        )
        .unwrap();
        // zero is clamped so the interval timer never spins
        assert_eq!(config.outbox_interval(), Duration::from_secs(1));
        assert_eq!(config.default_duplicate_policy, DuplicatePolicy::Error);
        assert_eq!(config.outbox_batch_limit, 50);
    }
}
