//! Artifact persistence
//!
//! Finished artifacts are uploaded as a multipart form with a single
//! `audio` field. Any 2xx is success; failures are reported, never retried.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{info, warn};

use crate::error::{Result, SessionError};
use crate::session::Artifact;

/// Form field carrying the artifact
pub const AUDIO_FIELD: &str = "audio";

/// Where finished artifacts go
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(&self, artifact: &Artifact) -> Result<()>;
}

/// Uploads artifacts to an HTTP endpoint
pub struct HttpStore {
    client: reqwest::Client,
    url: String,
    file_name: String,
}

impl HttpStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            file_name: "recording.wav".to_string(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ArtifactStore for HttpStore {
    async fn store(&self, artifact: &Artifact) -> Result<()> {
        let part = Part::bytes(artifact.bytes().to_vec())
            .file_name(self.file_name.clone())
            .mime_str(artifact.media_type())
            .map_err(|e| SessionError::PersistFailed(format!("invalid media type: {e}")))?;
        let form = Form::new().part(AUDIO_FIELD, part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SessionError::PersistFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, %status, "artifact upload rejected");
            return Err(SessionError::PersistFailed(format!("server returned {status}")));
        }

        info!(
            url = %self.url,
            bytes = artifact.len(),
            generation = artifact.generation(),
            "artifact stored"
        );
        Ok(())
    }
}
