//! Session collaborator: the bearer credential and its teardown.

use std::sync::RwLock;
use tracing::info;

/// Credentials of the signed-in operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: Option<String>,
}

/// Source of the current bearer credential.
///
/// Reads are synchronous. `invalidate` is the logout hook invoked when the
/// remote service rejects the credential.
pub trait Session: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    fn user_id(&self) -> Option<String>;

    fn invalidate(&self);
}

/// Session held in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticSession {
    credentials: RwLock<Option<Credentials>>,
}

impl StaticSession {
    pub fn new(token: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            credentials: RwLock::new(Some(Credentials {
                token: token.into(),
                user_id,
            })),
        }
    }

    /// A session with no credential.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.credentials
            .read()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    fn current(&self) -> Option<Credentials> {
        self.credentials.read().ok().and_then(|c| c.clone())
    }
}

impl Session for StaticSession {
    fn bearer_token(&self) -> Option<String> {
        self.current().map(|c| c.token)
    }

    fn user_id(&self) -> Option<String> {
        self.current().and_then(|c| c.user_id)
    }

    fn invalidate(&self) {
        if let Ok(mut credentials) = self.credentials.write() {
            if credentials.take().is_some() {
                info!("Session invalidated, re-authentication required");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_exposes_credentials() {
        let session = StaticSession::new("tok", Some("user-1".to_string()));
        assert!(session.is_active());
        assert_eq!(session.bearer_token().as_deref(), Some("tok"));
        assert_eq!(session.user_id().as_deref(), Some("user-1"));
    }

    #[test]
    fn test_invalidate_clears_credentials() {
        let session = StaticSession::new("tok", None);
        session.invalidate();
        assert!(!session.is_active());
        assert!(session.bearer_token().is_none());

        // second call is a no-op
        session.invalidate();
        assert!(!session.is_active());
    }

    #[test]
    fn test_anonymous_session() {
        assert!(StaticSession::anonymous().bearer_token().is_none());
    }
}
