//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use fieldsync_remote::RemoteConfig;
use fieldsync_sync::SyncConfig;

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Record database. Defaults to `fieldsync.db` in the data directory.
    pub database: Option<PathBuf>,
    /// Forms document. Defaults to `forms.json` in the data directory.
    pub forms: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub token: Option<String>,
    pub user_id: Option<String>,
}

/// Platform data directory for fieldsync.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

impl CliConfig {
    /// Load `path`, or the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (data_dir().join("config.json"), false),
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| data_dir().join("fieldsync.db"))
    }

    pub fn forms_path(&self) -> PathBuf {
        self.forms
            .clone()
            .unwrap_or_else(|| data_dir().join("forms.json"))
    }

    /// Export directory, with relative paths resolved against the data directory.
    pub fn export_dir(&self) -> PathBuf {
        if self.sync.export_dir.is_absolute() {
            self.sync.export_dir.clone()
        } else {
            data_dir().join(&self.sync.export_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"remote": {{"base_url": "https://api.example.com"}}, "token": "tok"}}"#
        )
        .unwrap();

        let config = CliConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.remote.base_url, "https://api.example.com");
        assert_eq!(config.remote.endpoints.ingest, "/scan");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.sync.outbox_batch_limit, 50);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(Some(dir.path().join("nope.json").as_path())).is_err());
    }

    #[test]
    fn test_relative_export_dir_lands_in_data_dir() {
        let config = CliConfig::default();
        assert_eq!(config.export_dir(), data_dir().join("exports"));
    }
}
