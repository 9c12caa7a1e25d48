//! HTTP client for the remote service.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::{BatchId, Error, Result};

use crate::config::RemoteConfig;
use crate::service::{ExportSubmission, IngestPayload, RemoteService};
use crate::session::Session;

/// Characters escaped inside a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// Remote service reached over HTTP with a bearer credential.
pub struct HttpRemote {
    http: Client,
    config: RemoteConfig,
    session: Arc<dyn Session>,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    ///
    /// # Errors
    /// - Invalid base URL
    /// - HTTP client construction failure
    pub fn new(config: RemoteConfig, session: Arc<dyn Session>) -> Result<Self> {
        config.validate()?;

        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            session,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Attach the bearer credential, if any.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to {}: {}", what, e)))?;
        self.check_status(response, what).await
    }

    /// Map non-success statuses onto the error taxonomy.
    async fn check_status(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!("Remote rejected credential while trying to {}", what);
            return Err(Error::Authentication(
                "Invalid or expired token".to_string(),
            ));
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            body
        };
        debug!("Remote answered {} to {}: {}", status, what, message);
        Err(Error::Remote {
            status: status.as_u16(),
            message,
        })
    }

    /// Read a status payload. Empty bodies become `null`, non-JSON text a string.
    async fn read_payload(response: Response) -> Result<serde_json::Value> {
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn ingest(&self, payload: &IngestPayload) -> Result<()> {
        let url = self.config.url_for(&self.config.endpoints.ingest);
        let request = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(payload);

        self.send(request, "ingest record").await?;
        debug!(record_id = %payload.id, "Record ingested");
        Ok(())
    }

    async fn submit_export(&self, submission: &ExportSubmission) -> Result<serde_json::Value> {
        let url = self.config.url_for(&self.config.endpoints.export);
        let request = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(submission);

        let response = self.send(request, "submit export").await?;
        Self::read_payload(response).await
    }

    async fn resend_export(&self, batch_id: &BatchId) -> Result<serde_json::Value> {
        let path = format!(
            "{}/{}",
            self.config.endpoints.resend.trim_end_matches('/'),
            segment(batch_id.as_str())
        );
        let request = self
            .http
            .post(self.config.url_for(&path))
            .header(header::CONTENT_TYPE, "application/json");

        let response = self.send(request, "resend export").await?;
        Self::read_payload(response).await
    }

    async fn download_export(&self, batch_id: &BatchId, filename: &str) -> Result<Bytes> {
        let path = format!(
            "{}/{}/{}",
            self.config.endpoints.file.trim_end_matches('/'),
            segment(batch_id.as_str()),
            segment(filename)
        );
        let request = self.http.get(self.config.url_for(&path));

        let response = self.send(request, "download export").await?;
        response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read export artifact: {}", e)))
    }

    async fn list_exports(&self) -> Result<serde_json::Value> {
        let url = self.config.url_for(&self.config.endpoints.list);
        let request = self
            .http
            .get(&url)
            .header(header::CONTENT_TYPE, "application/json");

        let response = self.send(request, "list exports").await?;
        Self::read_payload(response).await
    }
}
