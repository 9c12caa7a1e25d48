//! Share target handing artifacts to the desktop's default application.

use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use fieldsync_common::{Error, Result};
use fieldsync_sync::ShareTarget;

/// Opens downloaded artifacts with the system's default handler.
pub struct OpenShare {
    enabled: bool,
}

impl OpenShare {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl ShareTarget for OpenShare {
    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn share(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        debug!("Opening {}", path.display());
        tokio::task::spawn_blocking(move || open::that(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}
