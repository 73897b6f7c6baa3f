use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use clickfit_core::adapter::{AdapterError, WorkoutAnalyzer};
use clickfit_core::types::WorkoutGuess;

const RESPONSE_SHAPE: &str = r#"{"activity_type": string, "duration_minutes": number or null, "calories_burned": number or null, "heart_rate_avg": number or null, "distance_km": number or null}"#;

/// Client for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Creates a new client; `base_url` must end with a slash
    /// (e.g. `https://generativelanguage.googleapis.com/v1beta/`).
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Sends one prompt (plus an optional inline JPEG) and returns the model text.
    pub async fn generate(
        &self,
        prompt: &str,
        image_base64: Option<&str>,
    ) -> Result<String, GeminiError> {
        let url = self
            .base_url
            .join(&format!("models/{}:generateContent", self.model))?;

        let mut parts = vec![Part::Text { text: prompt }];
        if let Some(data) = image_base64 {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: "image/jpeg",
                    data,
                },
            });
        }
        let body = GenerateContentRequest {
            contents: vec![Content { parts }],
        };

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let parsed: GenerateContentResponse = parse_json(response).await?;
        parsed
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .find_map(|part| part.text)
            .ok_or(GeminiError::EmptyResponse)
    }

    async fn extract(
        &self,
        prompt: &str,
        image_base64: Option<&str>,
    ) -> Result<WorkoutGuess, GeminiError> {
        let text = self.generate(prompt, image_base64).await?;
        parse_guess(&text)
    }
}

#[async_trait]
impl WorkoutAnalyzer for GeminiClient {
    async fn analyze_image(
        &self,
        image_base64: &str,
        text_hint: &str,
    ) -> Result<WorkoutGuess, AdapterError> {
        let prompt = image_prompt(text_hint);
        Ok(self.extract(&prompt, Some(image_base64)).await?)
    }

    async fn analyze_text(&self, text: &str) -> Result<WorkoutGuess, AdapterError> {
        let prompt = text_prompt(text);
        Ok(self.extract(&prompt, None).await?)
    }
}

fn image_prompt(text_hint: &str) -> String {
    let hint = text_hint.trim();
    let mut prompt = String::from(
        "Analyze this workout screenshot and extract: the activity type \
         (e.g. Running, Basketball, Cycling, Gym; capitalized), the duration in minutes, \
         calories burned (estimate from activity and duration when not visible), \
         the average heart rate, and the distance in km when applicable.\n",
    );
    if !hint.is_empty() {
        prompt.push_str(&format!("Message from the athlete: \"{hint}\"\n"));
    }
    prompt.push_str("Reply with exactly one JSON object of the form ");
    prompt.push_str(RESPONSE_SHAPE);
    prompt
}

fn text_prompt(text: &str) -> String {
    format!(
        "From ONLY the text below, infer a workout summary. Use null for values \
         that are not stated and \"unknown\" for an unstated activity.\n\
         Text: \"{}\"\n\
         Reply with exactly one JSON object of the form {RESPONSE_SHAPE}",
        text.trim()
    )
}

/// Parses the first `{ ... }` span of free-form model output.
pub fn parse_guess(text: &str) -> Result<WorkoutGuess, GeminiError> {
    let start = text.find('{').ok_or(GeminiError::MissingJson)?;
    let end = text.rfind('}').ok_or(GeminiError::MissingJson)?;
    if end < start {
        return Err(GeminiError::MissingJson);
    }
    let value: Value = serde_json::from_str(&text[start..=end])?;
    if !value.is_object() {
        return Err(GeminiError::MissingJson);
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    InlineData { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'static str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Errors produced by the Gemini client.
#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response contained no text candidates")]
    EmptyResponse,
    #[error("response text did not contain a JSON object")]
    MissingJson,
    #[error("failed to decode model output: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<GeminiError> for AdapterError {
    fn from(err: GeminiError) -> Self {
        match err {
            GeminiError::Status { status, body } => AdapterError::Status {
                status: status.as_u16(),
                body,
            },
            GeminiError::Http(err) => AdapterError::Network(err.to_string()),
            GeminiError::Url(err) => AdapterError::Network(err.to_string()),
            other => AdapterError::Malformed(other.to_string()),
        }
    }
}

async fn parse_json<T>(response: Response) -> Result<T, GeminiError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(GeminiError::Status { status, body });
    }

    Ok(response.json().await?)
}
