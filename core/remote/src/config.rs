//! Remote endpoint configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use fieldsync_common::{Error, Result};

/// Default API base when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";

/// Paths of the remote operations, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// `POST`, one record.
    pub ingest: String,
    /// `POST`, one export batch.
    pub export: String,
    /// `POST {resend}/{exportId}`.
    pub resend: String,
    /// `GET {file}/{exportId}/{filename}`.
    pub file: String,
    /// `GET`, the server's export list.
    pub list: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ingest: "/scan".to_string(),
            export: "/api/export".to_string(),
            resend: "/api/exports/resend".to_string(),
            file: "/api/exports/file".to_string(),
            list: "/api/exports".to_string(),
        }
    }
}

/// Configuration for talking to the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Overall request timeout. `None` leaves the HTTP client default.
    pub request_timeout_secs: Option<u64>,
    /// Timeout of a single reachability probe.
    pub probe_timeout_secs: u64,
    pub endpoints: Endpoints,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: concat!("fieldsync/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: None,
            probe_timeout_secs: 3,
            endpoints: Endpoints::default(),
        }
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Check the base URL parses as an absolute http(s) URL.
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {}: {}", self.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Config(format!(
                "unsupported URL scheme {} in {}",
                other, self.base_url
            ))),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Absolute URL of an endpoint path.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
