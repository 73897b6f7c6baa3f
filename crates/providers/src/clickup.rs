use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::warn;

use clickfit_core::adapter::{AdapterError, ImageFetcher};

/// Downloads ClickUp attachments.
///
/// Attachment URLs are usually signed and public, so the first attempt is
/// anonymous. When it fails and an API token is configured, the download is
/// retried once with the token.
#[derive(Clone)]
pub struct ClickUpClient {
    http: Client,
    api_token: Option<String>,
}

impl ClickUpClient {
    pub fn new(api_token: Option<String>, http: Client) -> Self {
        Self {
            http,
            api_token: api_token.filter(|token| !token.is_empty()),
        }
    }

    /// Fetches the attachment and returns the raw bytes.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        match self.get(url, None).await {
            Ok(bytes) => Ok(bytes),
            Err(first) => {
                let Some(token) = self.api_token.as_deref() else {
                    return Err(first);
                };
                warn!(stage = "ingest", %url, error = %first, "anonymous download failed, retrying with token");
                self.get(url, Some(token)).await
            }
        }
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>, DownloadError> {
        let mut request = self.http.get(url);
        if let Some(token) = token {
            // Personal API tokens are sent without a Bearer prefix.
            request = request.header("Authorization", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(DownloadError::Status { status, body });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ImageFetcher for ClickUpClient {
    async fn fetch_base64(&self, url: &str) -> Result<String, AdapterError> {
        let bytes = self.download(url).await?;
        Ok(STANDARD.encode(bytes))
    }
}

/// Errors produced while downloading attachments.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl From<DownloadError> for AdapterError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Http(err) => AdapterError::Network(err.to_string()),
            DownloadError::Status { status, body } => AdapterError::Status {
                status: status.as_u16(),
                body,
            },
        }
    }
}
