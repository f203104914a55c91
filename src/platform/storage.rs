//! Artifact upload for submission files.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::models::StoredArtifact;
use crate::errors::ApiError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredArtifact, ApiError>;
}

/// Content-addressed object key: `prefix/<sha256-12>-<uuid>-<file>`.
pub fn artifact_key(prefix: &str, file_name: &str, bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    let file = file_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|f| !f.is_empty())
        .unwrap_or("artifact");
    let prefix = prefix.trim_matches('/');
    let name = format!("{}-{}-{}", &digest[..12], uuid::Uuid::new_v4(), file);
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// Uploads with a plain `PUT` to `<upload_url>/<key>`.
pub struct HttpArtifactStore {
    http: reqwest::Client,
    upload_url: String,
    public_url: String,
    prefix: String,
}

impl HttpArtifactStore {
    pub fn new(
        http: reqwest::Client,
        upload_url: impl Into<String>,
        public_url: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            http,
            upload_url: upload_url.into(),
            public_url: public_url.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredArtifact, ApiError> {
        let key = artifact_key(&self.prefix, file_name, &bytes);
        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .to_string();
        let target = format!("{}/{}", self.upload_url.trim_end_matches('/'), key);
        let size = bytes.len();

        let resp = self
            .http
            .put(&target)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| ApiError::Upload(format!("PUT {target}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ApiError::Upload(format!(
                "PUT {target} returned HTTP {}",
                resp.status().as_u16()
            )));
        }

        tracing::info!(key = %key, size, "uploaded artifact");
        Ok(StoredArtifact {
            url: format!("{}/{}", self.public_url.trim_end_matches('/'), key),
            key,
        })
    }
}
