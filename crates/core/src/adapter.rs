use async_trait::async_trait;
use thiserror::Error;

use crate::types::WorkoutGuess;

/// Failure of an external collaborator call. Always recoverable for the
/// ingestion pipeline: the caller records it and moves to the next tier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("analyzer is not configured")]
    Disabled,
}

/// Structured extraction of workout data from an image and/or text.
#[async_trait]
pub trait WorkoutAnalyzer: Send + Sync {
    async fn analyze_image(
        &self,
        image_base64: &str,
        text_hint: &str,
    ) -> Result<WorkoutGuess, AdapterError>;

    async fn analyze_text(&self, text: &str) -> Result<WorkoutGuess, AdapterError>;
}

/// Downloads an attachment and returns its bytes base64 encoded.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_base64(&self, url: &str) -> Result<String, AdapterError>;
}

/// Analyzer used when no inference credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAnalyzer;

#[async_trait]
impl WorkoutAnalyzer for DisabledAnalyzer {
    async fn analyze_image(&self, _: &str, _: &str) -> Result<WorkoutGuess, AdapterError> {
        Err(AdapterError::Disabled)
    }

    async fn analyze_text(&self, _: &str) -> Result<WorkoutGuess, AdapterError> {
        Err(AdapterError::Disabled)
    }
}
