//! Connectivity monitor gating network-dependent work.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use fieldsync_common::{Error, Result};

use crate::config::RemoteConfig;

/// What a probe could determine about reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    /// Positively determined: no connectivity.
    Offline,
    /// The probe ran but could not decide.
    Unknown,
}

/// A single reachability check. Read-only and side-effect-free.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<Reachability>;
}

/// Answers "are we online?" in two flavours.
///
/// `is_online` fails open: anything short of a positive "offline" counts as
/// online, so background uploads are not blocked by a flaky probe.
/// `is_online_strict` fails closed: only a positive "online" counts, so a
/// user-initiated export never proceeds on a guess.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    probe: Arc<dyn ConnectivityProbe>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { probe }
    }

    /// Fail-open check used by background delivery.
    pub async fn is_online(&self) -> bool {
        match self.probe.probe().await {
            Ok(Reachability::Offline) => false,
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe failed, assuming online: {}", e);
                true
            }
        }
    }

    /// Fail-closed check used before a batch export.
    pub async fn is_online_strict(&self) -> bool {
        match self.probe.probe().await {
            Ok(Reachability::Online) => true,
            Ok(state) => {
                debug!("Connectivity not confirmed: {:?}", state);
                false
            }
            Err(e) => {
                warn!("Connectivity probe failed, treating as offline: {}", e);
                false
            }
        }
    }
}

/// Probes reachability of the remote service's base URL.
///
/// Any HTTP answer means online, a refused connection means offline, and a
/// timeout is undecided.
pub struct HttpProbe {
    http: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create probe client: {}", e)))?;
        Ok(Self {
            http,
            url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<Reachability> {
        match self.http.head(&self.url).send().await {
            Ok(_) => Ok(Reachability::Online),
            Err(e) if e.is_connect() => Ok(Reachability::Offline),
            Err(e) if e.is_timeout() => Ok(Reachability::Unknown),
            Err(e) => Err(Error::Network(format!("Connectivity probe failed: {}", e))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ManualState {
    Fixed(Reachability),
    Failing,
}

/// Probe whose answer is set by hand; for tests and forced offline mode.
#[derive(Debug)]
pub struct ManualProbe {
    state: Mutex<ManualState>,
}

impl ManualProbe {
    pub fn new(reachability: Reachability) -> Self {
        Self {
            state: Mutex::new(ManualState::Fixed(reachability)),
        }
    }

    pub fn online() -> Self {
        Self::new(Reachability::Online)
    }

    pub fn offline() -> Self {
        Self::new(Reachability::Offline)
    }

    pub fn set(&self, reachability: Reachability) {
        if let Ok(mut state) = self.state.lock() {
            *state = ManualState::Fixed(reachability);
        }
    }

    /// Make every probe fail with an error.
    pub fn set_failing(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ManualState::Failing;
        }
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn probe(&self) -> Result<Reachability> {
        let state = self
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ManualState::Failing);
        match state {
            ManualState::Fixed(reachability) => Ok(reachability),
            ManualState::Failing => Err(Error::Network("probe unavailable".to_string())),
        }
    }
}
